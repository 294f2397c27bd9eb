//! In-process publish/subscribe hub.
//!
//! Services announce entity changes here; cache overlays and anything else
//! interested in "this entity changed" subscribe by event name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::util::lock::{read_guard, write_guard};

const SOURCE: &str = "application::events";

/// Emitted by the accessor after a successful insert.
pub const RECORD_CREATED: &str = "record:created";
pub const RECORD_UPDATED: &str = "record:updated";
pub const RECORD_DELETED: &str = "record:deleted";
pub const RECORD_UPSERTED: &str = "record:upserted";
/// Every write notification, for subscribers that only care that a table changed.
pub const RECORD_WRITES: [&str; 4] = [RECORD_CREATED, RECORD_UPDATED, RECORD_DELETED, RECORD_UPSERTED];

/// Global error notification raised for every failed store operation.
pub const APP_ERROR: &str = "app:error";

pub type HandlerId = u64;

/// A delivered event.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub payload: Value,
    pub timestamp: OffsetDateTime,
}

pub type EventHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Fan-out hub keyed by event name.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for `name` and return an id usable with [`EventBus::off`].
    pub fn on<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        write_guard(&self.handlers, SOURCE, "on")
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler, or every handler for `name` when `handler` is `None`.
    ///
    /// Returns how many handlers were removed.
    pub fn off(&self, name: &str, handler: Option<HandlerId>) -> usize {
        let mut handlers = write_guard(&self.handlers, SOURCE, "off");
        match handler {
            None => handlers.remove(name).map_or(0, |removed| removed.len()),
            Some(id) => {
                let Some(registered) = handlers.get_mut(name) else {
                    return 0;
                };
                let before = registered.len();
                registered.retain(|(existing, _)| *existing != id);
                let removed = before - registered.len();
                if registered.is_empty() {
                    handlers.remove(name);
                }
                removed
            }
        }
    }

    /// Deliver `payload` to every handler registered for `name`.
    ///
    /// Handlers run synchronously on the caller's task, outside the registry
    /// lock, so a handler may itself call `on`/`off`/`emit`.
    pub fn emit(&self, name: &str, payload: Value) -> usize {
        let targets: Vec<EventHandler> = read_guard(&self.handlers, SOURCE, "emit")
            .get(name)
            .map(|registered| {
                registered
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect()
            })
            .unwrap_or_default();

        let event = BusEvent {
            name: name.to_string(),
            payload,
            timestamp: OffsetDateTime::now_utc(),
        };

        debug!(event = name, handlers = targets.len(), "Bus event emitted");

        for handler in &targets {
            handler(&event);
        }
        targets.len()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        read_guard(&self.handlers, SOURCE, "handler_count")
            .get(name)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder(bus: &EventBus, name: &str) -> Arc<Mutex<Vec<BusEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(name, move |event| {
            sink.lock().expect("sink lock").push(event.clone());
        });
        seen
    }

    #[test]
    fn emit_reaches_every_handler_for_the_name() {
        let bus = EventBus::new();
        let first = recorder(&bus, "article:created");
        let second = recorder(&bus, "article:created");
        let other = recorder(&bus, "article:deleted");

        let delivered = bus.emit("article:created", json!({"articleId": "a"}));

        assert_eq!(delivered, 2);
        assert_eq!(first.lock().expect("lock").len(), 1);
        assert_eq!(second.lock().expect("lock").len(), 1);
        assert!(other.lock().expect("lock").is_empty());
        assert_eq!(
            first.lock().expect("lock")[0].payload["articleId"],
            json!("a")
        );
    }

    #[test]
    fn off_removes_one_or_all_handlers() {
        let bus = EventBus::new();
        let keep = bus.on("x", |_| {});
        let drop_me = bus.on("x", |_| {});
        bus.on("x", |_| {});

        assert_eq!(bus.off("x", Some(drop_me)), 1);
        assert_eq!(bus.handler_count("x"), 2);
        assert_eq!(bus.off("x", Some(drop_me)), 0);
        assert_eq!(bus.off("x", None), 2);
        assert_eq!(bus.handler_count("x"), 0);
        assert_eq!(bus.off("x", Some(keep)), 0);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        let seen = recorder(&bus, "second");
        bus.on("first", move |_| {
            inner.emit("second", Value::Null);
        });

        bus.emit("first", Value::Null);
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }
}
