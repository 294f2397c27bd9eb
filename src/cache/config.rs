//! Cache configuration.
//!
//! TTL windows per overlay, resolved from the `[cache]` table of `sitecms.toml`.

use serde::Deserialize;
use time::Duration;

const DEFAULT_ARTICLES_TTL_MS: u64 = 300_000;
const DEFAULT_SOCIAL_POSTS_TTL_MS: u64 = 300_000;
const DEFAULT_LESSON_STATUS_TTL_MS: u64 = 60_000;
const DEFAULT_ADMIN_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every overlay is built disabled and reads always hit the store.
    pub enabled: bool,
    pub articles_ttl_ms: u64,
    pub social_posts_ttl_ms: u64,
    pub lesson_status_ttl_ms: u64,
    /// Shared by the admin article and social-post overlays.
    pub admin_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            articles_ttl_ms: DEFAULT_ARTICLES_TTL_MS,
            social_posts_ttl_ms: DEFAULT_SOCIAL_POSTS_TTL_MS,
            lesson_status_ttl_ms: DEFAULT_LESSON_STATUS_TTL_MS,
            admin_ttl_ms: DEFAULT_ADMIN_TTL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            articles_ttl_ms: settings.articles_ttl_ms.get(),
            social_posts_ttl_ms: settings.social_posts_ttl_ms.get(),
            lesson_status_ttl_ms: settings.lesson_status_ttl_ms.get(),
            admin_ttl_ms: settings.admin_ttl_ms.get(),
        }
    }
}

impl CacheConfig {
    /// Every overlay uses the same window; handy in tests.
    pub fn uniform(ttl_ms: u64) -> Self {
        Self {
            enabled: true,
            articles_ttl_ms: ttl_ms,
            social_posts_ttl_ms: ttl_ms,
            lesson_status_ttl_ms: ttl_ms,
            admin_ttl_ms: ttl_ms,
        }
    }

    pub fn articles_ttl(&self) -> Duration {
        millis(self.articles_ttl_ms)
    }

    pub fn social_posts_ttl(&self) -> Duration {
        millis(self.social_posts_ttl_ms)
    }

    pub fn lesson_status_ttl(&self) -> Duration {
        millis(self.lesson_status_ttl_ms)
    }

    pub fn admin_ttl(&self) -> Duration {
        millis(self.admin_ttl_ms)
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.articles_ttl(), Duration::minutes(5));
        assert_eq!(config.social_posts_ttl(), Duration::minutes(5));
        assert_eq!(config.lesson_status_ttl(), Duration::minutes(1));
        assert_eq!(config.admin_ttl(), Duration::seconds(30));
    }

    #[test]
    fn uniform_applies_to_every_overlay() {
        let config = CacheConfig::uniform(5_000);
        assert_eq!(config.articles_ttl(), Duration::seconds(5));
        assert_eq!(config.admin_ttl(), Duration::seconds(5));
    }

    #[test]
    fn oversized_ttl_saturates() {
        let config = CacheConfig::uniform(u64::MAX);
        assert_eq!(config.lesson_status_ttl(), Duration::milliseconds(i64::MAX));
    }
}
