//! Backing-store adapters.
//!
//! The store speaks to a small key/value command surface ([`KvConnection`])
//! that both the Redis adapter and the in-process adapter implement. Which one
//! is used is decided by the scheme of the configured store URL.

mod memory;
mod remote;

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::pool::Manager;

pub use memory::{MemoryBackend, MemoryManager};
pub use remote::{RedisConnection, RedisManager};

/// Connection handed out by the store pool.
pub type BoxedConnection = Box<dyn KvConnection>;

/// Type-erased manager the store pool is built on.
pub type KvManager = Arc<dyn Manager<Connection = BoxedConnection>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("backing store command `{command}` failed: {detail}")]
    Command {
        command: &'static str,
        detail: String,
    },
    #[error("invalid backing store url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl BackendError {
    /// True when the connection itself is suspect and should not be reused.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Remaining lifetime of a key as reported by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(u64),
}

/// Command surface the cache store needs from a backing store.
#[async_trait]
pub trait KvConnection: Send {
    async fn ping(&mut self) -> Result<(), BackendError>;

    async fn get(&mut self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write `value` expiring after `ttl_ms`.
    async fn set_px(&mut self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BackendError>;

    /// Delete keys, returning how many existed.
    async fn del(&mut self, keys: &[String]) -> Result<u64, BackendError>;

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), BackendError>;

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, BackendError>;

    async fn pttl(&mut self, key: &str) -> Result<KeyTtl, BackendError>;

    /// Returns false when the key does not exist.
    async fn pexpire(&mut self, key: &str, ttl_ms: u64) -> Result<bool, BackendError>;

    /// One SCAN page. A returned cursor of zero ends the iteration.
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError>;

    /// Memory used by the store, when it reports one.
    async fn used_memory(&mut self) -> Result<Option<u64>, BackendError>;
}

/// Pick a backend from the store URL scheme.
///
/// `redis://` and `rediss://` open a Redis client; `memory://` creates a fresh
/// in-process store bounded by `max_keys`.
pub fn manager_for_url(url: &str, max_keys: NonZeroUsize) -> Result<KvManager, BackendError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("redis") | Some("rediss") => Ok(Arc::new(RedisManager::open(url)?)),
        Some("memory") => Ok(Arc::new(MemoryBackend::new(max_keys).manager())),
        _ => Err(BackendError::InvalidUrl {
            url: url.to_string(),
            reason: "expected a redis://, rediss:// or memory:// url".to_string(),
        }),
    }
}
