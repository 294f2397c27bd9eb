//! Entity cache overlays.
//!
//! Each entity service owns one [`EntityCacheOverlay`] holding the result of
//! its baseline read for a TTL window. Any successful write to the table,
//! from this service or another one sharing the bus, empties it.
//!
//! ```toml
//! [cache]
//! enabled = true
//! articles_ttl_ms = 300000
//! social_posts_ttl_ms = 300000
//! lesson_status_ttl_ms = 60000
//! admin_ttl_ms = 30000
//! ```

mod config;
mod overlay;

pub use config::CacheConfig;
pub use overlay::{
    CacheState, EntityCacheOverlay, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATE, METRIC_CACHE_MISS,
};
