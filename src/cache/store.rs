//! Tag-indexed response store.
//!
//! Records live under `<prefix><key>` with the record TTL. Each tag owns a set
//! at `<prefix>tag:<tag>` listing the full keys of its members; the set's own
//! TTL is stretched to cover its longest-lived member. The record write and
//! the index updates are separate round trips, so an index may briefly point
//! at keys that already expired. Invalidation tolerates that.
//!
//! Reads fail open: any backing-store problem is logged, counted and turned
//! into a miss.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendError, KeyTtl, KvConnection, KvManager};
use super::config::CacheConfig;
use super::keys::RESPONSE_NAMESPACE;
use super::pool::{Pool, PoolError, PoolStatus, PooledConnection};
use super::record::CacheRecord;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Pool of backing-store connections used by the store.
pub type KvPool = Pool<KvManager>;

type KvConn = PooledConnection<KvManager>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("caching is disabled or the backing store is unhealthy")]
    Disabled,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("backing store operation `{op}` failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("backing store operation `{op}` timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },
    #[error("failed to encode cache record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    /// True when the connection that produced this error should be dropped.
    fn poisons_connection(&self) -> bool {
        match self {
            CacheError::Timeout { .. } => true,
            CacheError::Backend { source, .. } => source.is_connection_failure(),
            _ => false,
        }
    }
}

/// Outcome of a tag invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub tags: usize,
    pub deleted_keys: u64,
    pub failed_tags: Vec<String>,
}

impl InvalidationReport {
    pub fn is_complete(&self) -> bool {
        self.failed_tags.is_empty()
    }
}

/// Snapshot of store activity and backing-store state.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub healthy: bool,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub keys: Option<u64>,
    pub tags: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub last_error: Option<String>,
    pub pool: PoolStatus,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Tag-indexed cache store over a pooled backing store.
pub struct CacheStore {
    config: CacheConfig,
    pool: KvPool,
    counters: Counters,
    last_error: Mutex<Option<String>>,
}

impl CacheStore {
    pub fn new(config: CacheConfig, pool: KvPool) -> Self {
        Self {
            config,
            pool,
            counters: Counters::default(),
            last_error: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pool(&self) -> &KvPool {
        &self.pool
    }

    /// Caching is switched on and the backing store is reachable.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.pool.is_healthy()
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.config.key_prefix, tag)
    }

    // ========================================================================
    // Public operations
    // ========================================================================
    //
    // Boxed: axum handlers and middleware need these futures `Send` for every
    // borrowed lifetime.

    /// Look up a record. Errors and undecodable payloads count as misses.
    pub fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<CacheRecord>> {
        self.read(key).boxed()
    }

    /// Store a record and index it under each of its tags.
    ///
    /// Index updates are best-effort: a failure there is logged and the write
    /// still counts as stored.
    pub fn set<'a>(
        &'a self,
        key: &'a str,
        record: &'a CacheRecord,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        self.write(key, record).boxed()
    }

    /// Remove one record. Returns whether it existed.
    pub fn delete_by_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        self.remove_key(key).boxed()
    }

    /// Remove every record whose key (without prefix) matches the glob `pattern`.
    pub fn delete_by_pattern<'a>(
        &'a self,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<u64, CacheError>> {
        self.remove_matching(pattern).boxed()
    }

    /// Remove every record indexed under any of `tags`, then the index entries.
    ///
    /// Tags are handled independently; one failing does not stop the rest.
    pub fn delete_by_tag<T: AsRef<str>>(&self, tags: &[T]) -> BoxFuture<'_, InvalidationReport> {
        let tags: Vec<String> = tags.iter().map(|tag| tag.as_ref().to_string()).collect();
        async move { self.remove_tagged(&tags).await }.boxed()
    }

    /// Write-path entry point: drop everything tagged with any of `tags`.
    pub fn invalidate<T: AsRef<str>>(&self, tags: &[T]) -> BoxFuture<'_, InvalidationReport> {
        let tags: Vec<String> = tags.iter().map(|tag| tag.as_ref().to_string()).collect();
        async move {
            let report = self.remove_tagged(&tags).await;
            info!(
                target = SOURCE,
                tags = report.tags,
                deleted = report.deleted_keys,
                failed = report.failed_tags.len(),
                "cache invalidated"
            );
            report
        }
        .boxed()
    }

    /// Counters plus live key/tag counts and memory usage when reachable.
    pub fn stats(&self) -> BoxFuture<'_, CacheStats> {
        self.snapshot().boxed()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    #[instrument(skip_all, fields(key = %key))]
    async fn read(&self, key: &str) -> Option<CacheRecord> {
        if !self.is_enabled() {
            return None;
        }
        let full_key = self.record_key(key);
        let Some(mut conn) = self.connection("get").await else {
            self.record_miss();
            return None;
        };

        let payload = match self.timed("get", conn.get(&full_key)).await {
            Ok(payload) => payload,
            Err(err) => {
                self.fail(conn, "get", key, err);
                self.record_miss();
                return None;
            }
        };

        let Some(payload) = payload else {
            self.record_miss();
            debug!(target = SOURCE, key, outcome = "miss");
            return None;
        };

        match serde_json::from_str::<CacheRecord>(&payload) {
            Ok(record) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!("shelfcache_cache_hit_total").increment(1);
                debug!(target = SOURCE, key, outcome = "hit");
                Some(record)
            }
            Err(err) => {
                warn!(target = SOURCE, key, error = %err, "dropping undecodable cache record");
                if let Err(err) = self.timed("del", conn.del(&[full_key])).await {
                    self.fail(conn, "del", key, err);
                }
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!("shelfcache_cache_miss_total").increment(1);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    #[instrument(skip_all, fields(key = %key, tags = record.tags.len()))]
    async fn write(&self, key: &str, record: &CacheRecord) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Err(CacheError::Disabled);
        }
        let payload = serde_json::to_string(record)?;
        let full_key = self.record_key(key);
        let ttl_ms = record.ttl_ms.max(1);
        let mut conn = self.require_connection("set").await?;

        if let Err(err) = self.timed("set", conn.set_px(&full_key, &payload, ttl_ms)).await {
            return Err(self.fail(conn, "set", key, err));
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        counter!("shelfcache_cache_set_total").increment(1);

        let tag_ttl_ms = self.config.tag_ttl_ms(ttl_ms);
        for tag in &record.tags {
            let tag_key = self.tag_key(tag);
            if let Err(err) = self.index(&mut conn, &tag_key, &full_key, tag_ttl_ms).await {
                let fatal = err.poisons_connection();
                self.fail(conn, "index", tag, err);
                if fatal {
                    break;
                }
                conn = match self.connection("index").await {
                    Some(conn) => conn,
                    None => break,
                };
            }
        }
        debug!(target = SOURCE, key, ttl_ms, outcome = "stored");
        Ok(())
    }

    async fn index(
        &self,
        conn: &mut KvConn,
        tag_key: &str,
        member: &str,
        ttl_ms: u64,
    ) -> Result<(), CacheError> {
        self.timed("sadd", conn.sadd(tag_key, member)).await?;
        let current = self.timed("pttl", conn.pttl(tag_key)).await?;
        let extend = match current {
            KeyTtl::Expires(remaining) => remaining < ttl_ms,
            KeyTtl::Persistent | KeyTtl::Missing => true,
        };
        if extend {
            self.timed("pexpire", conn.pexpire(tag_key, ttl_ms)).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    #[instrument(skip_all, fields(key = %key))]
    async fn remove_key(&self, key: &str) -> Result<bool, CacheError> {
        if !self.config.enabled {
            return Err(CacheError::Disabled);
        }
        let mut conn = self.require_connection("del").await?;
        match self.timed("del", conn.del(&[self.record_key(key)])).await {
            Ok(removed) => {
                self.record_deletes(removed);
                Ok(removed > 0)
            }
            Err(err) => Err(self.fail(conn, "del", key, err)),
        }
    }

    #[instrument(skip_all, fields(pattern = %pattern))]
    async fn remove_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        if !self.config.enabled {
            return Err(CacheError::Disabled);
        }
        let full_pattern = self.record_key(pattern);
        let page = self.config.scan_page_size();
        let mut conn = self.require_connection("scan").await?;
        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = match self.timed("scan", conn.scan(cursor, &full_pattern, page)).await {
                Ok(step) => step,
                Err(err) => return Err(self.fail(conn, "scan", pattern, err)),
            };
            match self.timed("del", conn.del(&keys)).await {
                Ok(removed) => deleted += removed,
                Err(err) => return Err(self.fail(conn, "del", pattern, err)),
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        self.record_deletes(deleted);
        info!(target = SOURCE, pattern, deleted, "deleted cache entries by pattern");
        Ok(deleted)
    }

    #[instrument(skip_all, fields(tags = tags.len()))]
    async fn remove_tagged(&self, tags: &[String]) -> InvalidationReport {
        let mut report = InvalidationReport {
            tags: tags.len(),
            ..InvalidationReport::default()
        };
        if !self.config.enabled {
            report.failed_tags = tags.to_vec();
            return report;
        }

        for tag in tags {
            match self.delete_tag(tag).await {
                Ok(removed) => report.deleted_keys += removed,
                Err(err) => {
                    warn!(target = SOURCE, tag = %tag, error = %err, "tag invalidation failed");
                    report.failed_tags.push(tag.clone());
                }
            }
        }
        self.record_deletes(report.deleted_keys);
        report
    }

    async fn delete_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let tag_key = self.tag_key(tag);
        let mut conn = self.require_connection("smembers").await?;
        let members = match self.timed("smembers", conn.smembers(&tag_key)).await {
            Ok(members) => members,
            Err(err) => return Err(self.fail(conn, "smembers", tag, err)),
        };

        let mut removed = 0;
        for chunk in members.chunks(self.config.scan_page_size()) {
            match self.timed("del", conn.del(chunk)).await {
                Ok(count) => removed += count,
                Err(err) => return Err(self.fail(conn, "del", tag, err)),
            }
        }
        if let Err(err) = self.timed("del", conn.del(&[tag_key])).await {
            return Err(self.fail(conn, "del", tag, err));
        }
        debug!(target = SOURCE, tag, members = members.len(), removed, "tag invalidated");
        Ok(removed)
    }

    fn record_deletes(&self, count: u64) {
        if count > 0 {
            self.counters.deletes.fetch_add(count, Ordering::Relaxed);
            counter!("shelfcache_cache_delete_total").increment(count);
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    async fn snapshot(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let (keys, tags, memory_bytes) = if self.config.enabled {
            self.live_counts().await
        } else {
            (None, None, None)
        };

        CacheStats {
            enabled: self.config.enabled,
            healthy: self.pool.is_healthy(),
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            keys,
            tags,
            memory_bytes,
            last_error: self.last_error(),
            pool: self.pool.status(),
        }
    }

    async fn live_counts(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Some(mut conn) = self.connection("stats").await else {
            return (None, None, None);
        };
        let keys = match self.count(&mut conn, RESPONSE_NAMESPACE).await {
            Ok(count) => count,
            Err(err) => {
                self.fail(conn, "scan", "stats", err);
                return (None, None, None);
            }
        };
        let tags = match self.count(&mut conn, "tag").await {
            Ok(count) => count,
            Err(err) => {
                self.fail(conn, "scan", "stats", err);
                return (Some(keys), None, None);
            }
        };
        let memory = match self.timed("info", conn.used_memory()).await {
            Ok(memory) => memory,
            Err(err) => {
                self.fail(conn, "info", "stats", err);
                None
            }
        };
        (Some(keys), Some(tags), memory)
    }

    async fn count(&self, conn: &mut KvConn, namespace: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}{}:*", self.config.key_prefix, namespace);
        let page = self.config.scan_page_size();
        let mut cursor = 0;
        let mut total = 0;
        loop {
            let (next, keys) = self.timed("scan", conn.scan(cursor, &pattern, page)).await?;
            total += keys.len() as u64;
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        mutex_lock(&self.last_error, SOURCE, "last_error")
            .clone()
            .or_else(|| self.pool.last_error())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, CacheError> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CacheError::Backend { op, source }),
            Err(_) => Err(CacheError::Timeout {
                op,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn require_connection(&self, op: &'static str) -> Result<KvConn, CacheError> {
        self.pool.acquire().await.map_err(|err| {
            let err = CacheError::from(err);
            self.note_error(op, "-", &err);
            err
        })
    }

    async fn connection(&self, op: &'static str) -> Option<KvConn> {
        self.require_connection(op).await.ok()
    }

    /// Log and count a failed operation; drops the connection when it is suspect.
    fn fail(&self, conn: KvConn, op: &'static str, subject: &str, err: CacheError) -> CacheError {
        self.note_error(op, subject, &err);
        if err.poisons_connection() {
            self.pool.mark_unhealthy(&err.to_string());
            conn.discard();
        }
        err
    }

    fn note_error(&self, op: &'static str, subject: &str, err: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        counter!("shelfcache_cache_error_total", "op" => op).increment(1);
        *mutex_lock(&self.last_error, SOURCE, "note_error") = Some(err.to_string());
        warn!(target = SOURCE, op, subject, error = %err, "cache operation failed");
    }
}
