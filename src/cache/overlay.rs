//! Per-entity TTL cache sitting over a table accessor.
//!
//! Entries live in an immutable snapshot tagged with the generation it was
//! built for. `invalidate` bumps the generation and drops the snapshot, so a
//! fetch that started before a write cannot reinstall what it read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use metrics::counter;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::application::events::{EventBus, HandlerId, RECORD_WRITES};
use crate::application::query::{Filter, OrderSpec, QueryOptions, paginate, sort_records};
use crate::domain::record::Record;
use crate::util::Clock;
use crate::util::lock::{read_guard, write_guard};

const SOURCE: &str = "cache::overlay";

pub const METRIC_CACHE_HIT: &str = "sitecms_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "sitecms_cache_miss_total";
pub const METRIC_CACHE_INVALIDATE: &str = "sitecms_cache_invalidate_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Empty,
    Warm,
    Stale,
}

struct Snapshot {
    inserted_at: OffsetDateTime,
    entries: HashMap<String, Record>,
}

#[derive(Default)]
struct OverlayState {
    generation: u64,
    snapshot: Option<Arc<Snapshot>>,
}

pub struct EntityCacheOverlay {
    entity: &'static str,
    table: String,
    ttl: Duration,
    enabled: bool,
    order: Vec<OrderSpec>,
    clock: Arc<dyn Clock>,
    state: RwLock<OverlayState>,
    refill: Mutex<()>,
}

impl EntityCacheOverlay {
    /// `order` is the entity's baseline ordering, used when serving from the cache.
    pub fn new(
        entity: &'static str,
        table: impl Into<String>,
        ttl: Duration,
        order: Vec<OrderSpec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entity,
            table: table.into(),
            ttl,
            enabled: true,
            order,
            clock,
            state: RwLock::new(OverlayState::default()),
            refill: Mutex::new(()),
        }
    }

    /// An overlay that never holds anything; every read goes to the store.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current generation; capture it before a fetch and hand it to
    /// [`EntityCacheOverlay::populate_if_current`].
    pub fn generation(&self) -> u64 {
        read_guard(&self.state, SOURCE, "generation").generation
    }

    pub fn state(&self) -> CacheState {
        match self.current_snapshot() {
            None => CacheState::Empty,
            Some(snapshot) if self.is_fresh(&snapshot) => CacheState::Warm,
            Some(_) => CacheState::Stale,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state() == CacheState::Warm
    }

    /// Number of cached records, stale or not.
    pub fn len(&self) -> usize {
        self.current_snapshot()
            .map_or(0, |snapshot| snapshot.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the cache contents unconditionally.
    pub fn populate(&self, records: Vec<Record>) {
        let mut state = write_guard(&self.state, SOURCE, "populate");
        let generation = state.generation;
        self.install(&mut state, records, generation);
    }

    /// Replace the cache contents only if no invalidation happened since
    /// `generation` was observed. Returns whether the records were installed.
    pub fn populate_if_current(&self, records: Vec<Record>, generation: u64) -> bool {
        let mut state = write_guard(&self.state, SOURCE, "populate_if_current");
        if state.generation != generation {
            debug!(
                entity = self.entity,
                observed = generation,
                current = state.generation,
                "Discarding fetch that raced an invalidation"
            );
            return false;
        }
        self.install(&mut state, records, generation)
    }

    /// Serve `options` from a warm cache.
    ///
    /// Returns `None` when the cache is not warm or the options narrow the
    /// baseline with anything other than boolean equality flags. Extra flags
    /// are applied, then the baseline order, then `offset`/`limit`.
    pub fn read_filtered(
        &self,
        options: &QueryOptions,
        baseline: &[Filter],
    ) -> Option<Vec<Record>> {
        let snapshot = self.current_snapshot()?;
        if !self.is_fresh(&snapshot) {
            return None;
        }

        let mut flags = Vec::new();
        for filter in options.filters.iter().filter(|f| !baseline.contains(f)) {
            filter.as_flag()?;
            flags.push(filter);
        }
        if baseline.iter().any(|filter| !options.filters.contains(filter)) {
            return None;
        }

        let mut rows: Vec<Record> = snapshot
            .entries
            .values()
            .filter(|row| flags.iter().all(|flag| flag.matches(row)))
            .cloned()
            .collect();
        sort_records(&mut rows, &self.order);
        Some(paginate(rows, options.offset, options.limit))
    }

    /// [`EntityCacheOverlay::read_filtered`] plus hit/miss accounting.
    pub fn lookup(&self, options: &QueryOptions, baseline: &[Filter]) -> Option<Vec<Record>> {
        let served = self.read_filtered(options, baseline);
        let metric = if served.is_some() {
            METRIC_CACHE_HIT
        } else {
            METRIC_CACHE_MISS
        };
        counter!(metric, "entity" => self.entity).increment(1);
        trace!(entity = self.entity, hit = served.is_some(), "Cache lookup");
        served
    }

    /// Drop every entry and move to a new generation.
    pub fn invalidate(&self) {
        let mut state = write_guard(&self.state, SOURCE, "invalidate");
        state.generation = state.generation.wrapping_add(1);
        let dropped = state.snapshot.take().map_or(0, |s| s.entries.len());
        drop(state);

        counter!(METRIC_CACHE_INVALIDATE, "entity" => self.entity).increment(1);
        debug!(entity = self.entity, dropped, "Cache invalidated");
    }

    /// Serialize refills so concurrent baseline misses share one fetch.
    pub async fn refill_lock(&self) -> MutexGuard<'_, ()> {
        self.refill.lock().await
    }

    /// Invalidate whenever any accessor reports a write to this overlay's table.
    pub fn watch(self: &Arc<Self>, bus: &EventBus) -> Vec<HandlerId> {
        RECORD_WRITES
            .iter()
            .map(|event| {
                let overlay: Weak<Self> = Arc::downgrade(self);
                bus.on(event, move |delivered| {
                    let Some(overlay) = overlay.upgrade() else {
                        return;
                    };
                    if delivered.payload["table"].as_str() == Some(overlay.table.as_str()) {
                        overlay.invalidate();
                    }
                })
            })
            .collect()
    }

    fn install(&self, state: &mut OverlayState, records: Vec<Record>, generation: u64) -> bool {
        if !self.enabled {
            return false;
        }

        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            match record.id_key() {
                Some(key) => {
                    entries.insert(key, record);
                }
                None => debug!(entity = self.entity, "Skipping cache row without id"),
            }
        }

        debug!(
            entity = self.entity,
            generation,
            records = entries.len(),
            "Cache populated"
        );
        state.snapshot = Some(Arc::new(Snapshot {
            inserted_at: self.clock.now_utc(),
            entries,
        }));
        true
    }

    fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        read_guard(&self.state, SOURCE, "snapshot").snapshot.clone()
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        self.enabled && self.clock.now_utc() - snapshot.inserted_at < self.ttl
    }
}
