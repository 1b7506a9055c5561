//! Cache configuration.
//!
//! Controls TTLs, key namespacing and backing-store limits via the `[cache]`
//! section of `shelfcache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_TTL_MS: u64 = 15 * 60 * 1000;
const DEFAULT_TAG_TTL_FLOOR_MS: u64 = 60 * 60 * 1000;
const DEFAULT_MAX_KEYS: usize = 10_000;
const DEFAULT_KEY_PREFIX: &str = "shelfcache:";
const DEFAULT_SCAN_PAGE_SIZE: usize = 100;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Cache configuration from `shelfcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global switch; when off every request goes straight to its handler.
    pub enabled: bool,
    /// TTL applied when a route policy does not set one.
    pub default_ttl_ms: u64,
    /// Lower bound for the lifetime of a tag index entry.
    pub tag_ttl_floor_ms: u64,
    /// Capacity of the in-process backend.
    pub max_keys: usize,
    /// Prefix prepended to every key written to the backing store.
    pub key_prefix: String,
    /// Keys requested per SCAN page during pattern deletion and stats.
    pub scan_page_size: usize,
    /// Deadline for a single backing-store round trip.
    pub operation_timeout_ms: u64,
    /// Responses larger than this pass through uncached.
    pub max_body_bytes: usize,
    /// Request path prefixes that are never cached.
    pub bypass_paths: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: DEFAULT_TTL_MS,
            tag_ttl_floor_ms: DEFAULT_TAG_TTL_FLOOR_MS,
            max_keys: DEFAULT_MAX_KEYS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            bypass_paths: Vec::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_ttl_ms: settings.default_ttl_ms,
            tag_ttl_floor_ms: settings.tag_ttl_floor_ms,
            max_keys: settings.max_keys.get(),
            key_prefix: settings.key_prefix.clone(),
            scan_page_size: settings.scan_page_size.get(),
            operation_timeout_ms: settings.operation_timeout_ms,
            max_body_bytes: settings.max_body_bytes,
            bypass_paths: settings.bypass_paths.clone(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }

    /// Returns the key capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_keys(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_keys).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn scan_page_size(&self) -> usize {
        self.scan_page_size.max(1)
    }

    /// Lifetime a tag index entry needs so it outlives a member stored for `ttl_ms`.
    pub fn tag_ttl_ms(&self, ttl_ms: u64) -> u64 {
        self.tag_ttl_floor_ms.max(ttl_ms)
    }

    /// True when `path` starts with one of the configured bypass prefixes.
    pub fn bypasses(&self, path: &str) -> bool {
        self.bypass_paths
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_ttl_never_drops_below_floor() {
        let config = CacheConfig {
            tag_ttl_floor_ms: 60_000,
            ..CacheConfig::default()
        };
        assert_eq!(config.tag_ttl_ms(1_000), 60_000);
        assert_eq!(config.tag_ttl_ms(120_000), 120_000);
    }

    #[test]
    fn bypass_matches_prefixes_only() {
        let config = CacheConfig {
            bypass_paths: vec!["/api/admin".to_string(), String::new()],
            ..CacheConfig::default()
        };
        assert!(config.bypasses("/api/admin/users"));
        assert!(!config.bypasses("/api/locations"));
    }

    #[test]
    fn zero_limits_are_clamped() {
        let config = CacheConfig {
            max_keys: 0,
            scan_page_size: 0,
            operation_timeout_ms: 0,
            ..CacheConfig::default()
        };
        assert_eq!(config.max_keys().get(), 1);
        assert_eq!(config.scan_page_size(), 1);
        assert_eq!(config.operation_timeout(), Duration::from_millis(1));
    }
}
