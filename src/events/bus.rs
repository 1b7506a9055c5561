//! In-process publish/subscribe.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use metrics::counter;
use tracing::{debug, error};

use super::event::{DomainEvent, EventType};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "events::bus";

/// Event callback. Must not block; spawn if work is slow.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    typed: HashMap<EventType, Vec<Subscriber>>,
    any: Vec<Subscriber>,
}

/// Synchronous multi-subscriber event bus.
///
/// `publish` snapshots the subscriber list and calls handlers with no lock
/// held, so handlers may subscribe or unsubscribe. A panicking handler is
/// logged and the remaining handlers still run.
#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, handler: EventHandler) -> Subscriber {
        Subscriber {
            id: SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            handler,
        }
    }

    /// Receive events of one type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let subscriber = self.allocate(Arc::new(handler));
        let id = subscriber.id;
        rw_write(&self.registry, SOURCE, "subscribe")
            .typed
            .entry(event_type)
            .or_default()
            .push(subscriber);
        id
    }

    /// Receive every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let subscriber = self.allocate(Arc::new(handler));
        let id = subscriber.id;
        rw_write(&self.registry, SOURCE, "subscribe_all")
            .any
            .push(subscriber);
        id
    }

    /// Remove a subscription. Unknown or already removed ids return false.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = rw_write(&self.registry, SOURCE, "unsubscribe");
        let before = registry.any.len();
        registry.any.retain(|subscriber| subscriber.id != id);
        if registry.any.len() != before {
            return true;
        }
        for subscribers in registry.typed.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.len() != before {
                return true;
            }
        }
        false
    }

    /// Deliver `event` to typed subscribers, then catch-all subscribers.
    ///
    /// Returns how many handlers completed without panicking.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        let event_type = event.event_type();
        let handlers: Vec<Subscriber> = {
            let registry = rw_read(&self.registry, SOURCE, "publish");
            registry
                .typed
                .get(&event_type)
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .cloned()
                .collect()
        };

        counter!("shelfcache_event_published_total", "type" => event_type.as_str()).increment(1);
        debug!(
            target = SOURCE,
            event_type = event_type.as_str(),
            event_id = %event.id,
            subscribers = handlers.len(),
            "publishing domain event"
        );

        let mut delivered = 0;
        for subscriber in handlers {
            let handler = subscriber.handler;
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    target = SOURCE,
                    event_type = event_type.as_str(),
                    subscription = subscriber.id.0,
                    "event handler panicked"
                ),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let registry = rw_read(&self.registry, SOURCE, "subscriber_count");
        registry.any.len() + registry.typed.values().map(Vec::len).sum::<usize>()
    }
}
