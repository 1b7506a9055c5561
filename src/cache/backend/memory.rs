//! In-process backend.
//!
//! Mirrors the subset of Redis semantics the store relies on (string values
//! with millisecond expiry, sets, SCAN with glob matching). String values live
//! in a bounded LRU; sets live beside it and only leave by expiry or DEL, so
//! capacity pressure on records never drops a tag index. Expiry follows
//! `tokio::time`, so paused-clock tests can fast-forward it. Used for
//! single-node deployments and tests; `set_online(false)` simulates an outage.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use globset::GlobBuilder;
use lru::LruCache;
use tokio::time::Instant;

use super::{BackendError, BoxedConnection, KeyTtl, KvConnection};
use crate::cache::pool::Manager;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::backend::memory";

/// Open SCAN cursors kept at once; the oldest is forgotten first.
const MAX_OPEN_CURSORS: usize = 256;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn ttl(&self, now: Instant) -> KeyTtl {
        match self.expires_at {
            None => KeyTtl::Persistent,
            Some(at) => {
                let remaining = at.saturating_duration_since(now);
                KeyTtl::Expires(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
            }
        }
    }
}

fn deadline(now: Instant, ttl_ms: u64) -> Instant {
    let ttl = Duration::from_millis(ttl_ms.max(1));
    now.checked_add(ttl).unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

struct Keyspace {
    records: LruCache<String, Expiring<String>>,
    sets: HashMap<String, Expiring<BTreeSet<String>>>,
    /// SCAN cursor id -> last key handed out on the previous page.
    cursors: LruCache<u64, String>,
    next_cursor: u64,
}

impl Keyspace {
    /// Drop `key` from whichever map holds it if it has expired.
    fn purge(&mut self, key: &str, now: Instant) {
        if self.records.peek(key).is_some_and(|entry| !entry.is_live(now)) {
            self.records.pop(key);
        }
        if self.sets.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.sets.remove(key);
        }
    }

    fn purge_expired_sets(&mut self, now: Instant) {
        self.sets.retain(|_, entry| entry.is_live(now));
    }

    fn live_keys(&self, now: Instant) -> impl Iterator<Item = &String> {
        let records = self
            .records
            .iter()
            .filter(move |(_, entry)| entry.is_live(now))
            .map(|(key, _)| key);
        let sets = self
            .sets
            .iter()
            .filter(move |(_, entry)| entry.is_live(now))
            .map(|(key, _)| key);
        records.chain(sets)
    }

    /// Remember where a SCAN page ended and hand back a non-zero cursor for it.
    fn open_cursor(&mut self, last_key: String) -> u64 {
        self.next_cursor = self.next_cursor.wrapping_add(1).max(1);
        let id = self.next_cursor;
        self.cursors.put(id, last_key);
        id
    }
}

struct MemoryState {
    keyspace: Mutex<Keyspace>,
    online: AtomicBool,
}

/// Shared in-process key/value store.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    /// `max_keys` bounds the string values; sets are not counted.
    pub fn new(max_keys: NonZeroUsize) -> Self {
        let open_cursors = NonZeroUsize::new(MAX_OPEN_CURSORS).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(MemoryState {
                keyspace: Mutex::new(Keyspace {
                    records: LruCache::new(max_keys),
                    sets: HashMap::new(),
                    cursors: LruCache::new(open_cursors),
                    next_cursor: 0,
                }),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Pool manager handing out connections to this store.
    pub fn manager(&self) -> MemoryManager {
        MemoryManager {
            backend: self.clone(),
        }
    }

    /// Toggle availability; while offline every command fails as unreachable.
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    /// Number of live keys, sets included.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let space = mutex_lock(&self.state.keyspace, SOURCE, "len");
        space.live_keys(now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                "in-process store is offline".to_string(),
            ))
        }
    }

    /// Run `f` against the keyspace after dropping `key` if it has expired.
    fn with_key<T>(
        &self,
        op: &'static str,
        key: &str,
        f: impl FnOnce(&mut Keyspace, Instant) -> T,
    ) -> Result<T, BackendError> {
        self.check_online()?;
        let now = Instant::now();
        let mut space = mutex_lock(&self.state.keyspace, SOURCE, op);
        space.purge(key, now);
        Ok(f(&mut space, now))
    }
}

/// [`Manager`] for the in-process store; creation fails while offline.
#[derive(Clone)]
pub struct MemoryManager {
    backend: MemoryBackend,
}

impl MemoryManager {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl Manager for MemoryManager {
    type Connection = BoxedConnection;

    async fn create(&self) -> Result<BoxedConnection, BackendError> {
        self.backend.check_online()?;
        Ok(Box::new(MemoryConnection {
            backend: self.backend.clone(),
        }))
    }

    async fn validate(&self, conn: &mut BoxedConnection) -> Result<(), BackendError> {
        conn.ping().await
    }
}

struct MemoryConnection {
    backend: MemoryBackend,
}

fn wrong_type(command: &'static str) -> BackendError {
    BackendError::Command {
        command,
        detail: "WRONGTYPE operation against a key holding the wrong kind of value".to_string(),
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<(), BackendError> {
        self.backend.check_online()
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, BackendError> {
        self.backend.with_key("get", key, |space, _| {
            if space.sets.contains_key(key) {
                return Err(wrong_type("GET"));
            }
            Ok(space.records.get(key).map(|entry| entry.value.clone()))
        })?
    }

    async fn set_px(&mut self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BackendError> {
        self.backend.with_key("set_px", key, |space, now| {
            // SET overwrites whatever the key held, like Redis.
            space.sets.remove(key);
            space.records.put(
                key.to_string(),
                Expiring {
                    value: value.to_string(),
                    expires_at: Some(deadline(now, ttl_ms)),
                },
            );
        })
    }

    async fn del(&mut self, keys: &[String]) -> Result<u64, BackendError> {
        self.backend.check_online()?;
        let now = Instant::now();
        let mut space = mutex_lock(&self.backend.state.keyspace, SOURCE, "del");
        let mut removed = 0_u64;
        for key in keys {
            if space.records.pop(key).is_some_and(|entry| entry.is_live(now)) {
                removed += 1;
            }
            if space.sets.remove(key).is_some_and(|entry| entry.is_live(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), BackendError> {
        self.backend.with_key("sadd", key, |space, now| {
            if space.records.contains(key) {
                return Err(wrong_type("SADD"));
            }
            space.purge_expired_sets(now);
            space
                .sets
                .entry(key.to_string())
                .or_insert_with(|| Expiring {
                    value: BTreeSet::new(),
                    expires_at: None,
                })
                .value
                .insert(member.to_string());
            Ok(())
        })?
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, BackendError> {
        self.backend.with_key("smembers", key, |space, _| {
            if space.records.contains(key) {
                return Err(wrong_type("SMEMBERS"));
            }
            Ok(space
                .sets
                .get(key)
                .map(|entry| entry.value.iter().cloned().collect())
                .unwrap_or_default())
        })?
    }

    async fn pttl(&mut self, key: &str) -> Result<KeyTtl, BackendError> {
        self.backend.with_key("pttl", key, |space, now| {
            if let Some(entry) = space.records.peek(key) {
                entry.ttl(now)
            } else if let Some(entry) = space.sets.get(key) {
                entry.ttl(now)
            } else {
                KeyTtl::Missing
            }
        })
    }

    async fn pexpire(&mut self, key: &str, ttl_ms: u64) -> Result<bool, BackendError> {
        self.backend.with_key("pexpire", key, |space, now| {
            let at = deadline(now, ttl_ms);
            if let Some(entry) = space.records.peek_mut(key) {
                entry.expires_at = Some(at);
                true
            } else if let Some(entry) = space.sets.get_mut(key) {
                entry.expires_at = Some(at);
                true
            } else {
                false
            }
        })
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        self.backend.check_online()?;
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|err| BackendError::Command {
                command: "SCAN",
                detail: err.to_string(),
            })?
            .compile_matcher();

        let now = Instant::now();
        let mut space = mutex_lock(&self.backend.state.keyspace, SOURCE, "scan");

        // Each page resumes strictly after the last key of the previous one, so
        // deleting or expiring keys between pages never skips a survivor.
        let after = match cursor {
            0 => None,
            id => match space.cursors.pop(&id) {
                Some(last_key) => Some(last_key),
                None => {
                    return Err(BackendError::Command {
                        command: "SCAN",
                        detail: format!("unknown cursor {id}"),
                    });
                }
            },
        };

        let mut keys: Vec<String> = space
            .live_keys(now)
            .filter(|key| after.as_ref().is_none_or(|last| *key > last))
            .cloned()
            .collect();
        keys.sort();

        let window = count.max(1);
        let exhausted = keys.len() <= window;
        keys.truncate(window);
        let next = match keys.last() {
            Some(last) if !exhausted => space.open_cursor(last.clone()),
            _ => 0,
        };
        let page = keys
            .into_iter()
            .filter(|key| matcher.is_match(key.as_str()))
            .collect();
        Ok((next, page))
    }

    async fn used_memory(&mut self) -> Result<Option<u64>, BackendError> {
        self.backend.check_online()?;
        let now = Instant::now();
        let space = mutex_lock(&self.backend.state.keyspace, SOURCE, "used_memory");
        let records: usize = space
            .records
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| key.len() + entry.value.len())
            .sum();
        let sets: usize = space
            .sets
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| key.len() + entry.value.iter().map(String::len).sum::<usize>())
            .sum();
        Ok(Some((records + sets) as u64))
    }
}
