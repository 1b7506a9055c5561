//! Cached response record as persisted in the backing store.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::keys::etag_for;

/// One cached HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub body: Value,
    pub status_code: u16,
    pub etag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
    pub ttl_ms: u64,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl CacheRecord {
    /// Build a record stamped with the current time; the ETag is derived from `body`.
    pub fn new<I, T>(key: impl Into<String>, status_code: u16, body: Value, ttl: Duration, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let etag = etag_for(&body);
        Self {
            key: key.into(),
            body,
            status_code,
            etag,
            stored_at: OffsetDateTime::now_utc(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            tags: tags.into_iter().map(Into::into).collect(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Saturates at the last representable instant for very long TTLs.
    pub fn expires_at(&self) -> OffsetDateTime {
        time::Duration::try_from(self.ttl())
            .ok()
            .and_then(|ttl| self.stored_at.checked_add(ttl))
            .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
    }

    /// Time left before expiry as seen from `now`; zero once expired.
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Duration {
        let remaining = self.expires_at() - now;
        if remaining.is_positive() {
            remaining.unsigned_abs()
        } else {
            Duration::ZERO
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.remaining_ttl(now).is_zero()
    }
}
