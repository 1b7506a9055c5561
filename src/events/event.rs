//! Domain event payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Who or what caused an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A change notification published on the bus and pushed to real-time clients.
///
/// Serialized flat: `{ "type": "...", "id", "timestamp", "context"?, ...payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
    #[serde(flatten)]
    pub kind: DomainEventKind,
}

impl DomainEvent {
    pub fn new(kind: DomainEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            context: None,
            kind,
        }
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

/// Type-specific payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DomainEventKind {
    Created {
        entity_type: String,
        entity_id: String,
        #[serde(default)]
        snapshot: Value,
    },
    Updated {
        entity_type: String,
        entity_id: String,
        #[serde(default)]
        snapshot: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        changed_fields: Vec<String>,
    },
    Deleted {
        entity_type: String,
        entity_id: String,
    },
    Moved {
        item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_location: Option<String>,
        to_location: String,
        quantity: i64,
    },
    StockChanged {
        item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location_id: Option<String>,
        previous: i64,
        current: i64,
    },
    LocationChanged {
        location_id: String,
        #[serde(default)]
        snapshot: Value,
    },
    BulkUpdated {
        entity_type: String,
        ids: Vec<String>,
    },
}

impl DomainEventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEventKind::Created { .. } => EventType::Created,
            DomainEventKind::Updated { .. } => EventType::Updated,
            DomainEventKind::Deleted { .. } => EventType::Deleted,
            DomainEventKind::Moved { .. } => EventType::Moved,
            DomainEventKind::StockChanged { .. } => EventType::StockChanged,
            DomainEventKind::LocationChanged { .. } => EventType::LocationChanged,
            DomainEventKind::BulkUpdated { .. } => EventType::BulkUpdated,
        }
    }
}

/// Discriminant used for typed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Moved,
    StockChanged,
    LocationChanged,
    BulkUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::Moved => "moved",
            EventType::StockChanged => "stock-changed",
            EventType::LocationChanged => "location-changed",
            EventType::BulkUpdated => "bulk-updated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
