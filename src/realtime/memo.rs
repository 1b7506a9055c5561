//! Short-lived memo of serialized event frames.

use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::events::DomainEvent;

struct MemoEntry {
    payload: Utf8Bytes,
    expires_at: Instant,
}

/// Serialize each event once; repeated sends within `ttl` reuse the bytes.
///
/// Keyed by event id, so two distinct updates to the same entity never share
/// a payload.
pub struct PayloadMemo {
    ttl: Duration,
    entries: DashMap<Uuid, MemoEntry>,
}

impl PayloadMemo {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn payload_for(&self, event: &DomainEvent) -> Result<Utf8Bytes, serde_json::Error> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&event.id) {
            if entry.expires_at > now {
                return Ok(entry.payload.clone());
            }
        }

        let payload = Utf8Bytes::from(serde_json::to_string(event)?);
        // Every new payload sweeps stale ones, so the memo stays bounded by
        // event rate times ttl without waiting for a heartbeat.
        self.purge_expired();
        let expires_at = now.checked_add(self.ttl).unwrap_or(now);
        self.entries.insert(
            event.id,
            MemoEntry {
                payload: payload.clone(),
                expires_at,
            },
        );
        Ok(payload)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
