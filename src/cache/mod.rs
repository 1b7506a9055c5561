//! Tag-indexed response cache.
//!
//! Read routes are wrapped with [`cached`] and a [`CachePolicy`]. On a miss
//! the handler's JSON output is captured into a [`CacheRecord`] and written
//! to the backing store together with one index set per tag; write paths
//! call [`CacheStore::invalidate`] with the tags they touched.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` and `[store]` sections of
//! `shelfcache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_ttl_ms = 900000
//! tag_ttl_floor_ms = 3600000
//!
//! [store]
//! url = "redis://127.0.0.1:6379"
//! max_connections = 10
//! ```
//!
//! Every backing-store failure is absorbed here: reads become misses and
//! writes are dropped, so an outage degrades latency and never correctness.

pub mod backend;
mod config;
mod keys;
mod middleware;
pub mod pool;
mod record;
mod store;
mod warmer;

pub use backend::{BackendError, KeyTtl, KvConnection, KvManager, MemoryBackend, manager_for_url};
pub use config::CacheConfig;
pub use keys::{
    RESPONSE_NAMESPACE, RequestFingerprint, Scope, canonicalize, content_hash, etag_for,
    etag_matches, query_value,
};
pub use middleware::{
    CachePolicy, CacheState, RequestShape, TagFn, TagSource, X_CACHE, X_CACHE_TAGS, X_CACHE_TTL,
    cached, response_cache_layer,
};
pub use pool::{Manager, Pool, PoolConfig, PoolError, PoolStatus, PooledConnection};
pub use record::CacheRecord;
pub use store::{CacheError, CacheStats, CacheStore, InvalidationReport, KvPool};
pub use warmer::{CacheWarmError, CacheWarmer, WarmEndpoint, WarmReport, WarmerConfig};
