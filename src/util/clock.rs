//! Wall-clock abstraction so TTL windows and publish stamps can be driven from tests.

use std::sync::atomic::{AtomicI64, Ordering};

use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}

/// Reads the host clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: OffsetDateTime,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(origin: OffsetDateTime) -> Self {
        Self {
            origin,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Start at the Unix epoch; convenient when only elapsed time matters.
    pub fn at_epoch() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn advance_ms(&self, millis: i64) {
        self.offset_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to `millis` after the origin.
    pub fn set_ms(&self, millis: i64) {
        self.offset_ms.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        self.origin + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Render a timestamp the way the store persists `created_at`/`updated_at`.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    // Rfc3339 only fails for years outside 0..=9999.
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}
