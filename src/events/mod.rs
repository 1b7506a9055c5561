//! Domain events.
//!
//! Write paths publish a [`DomainEvent`] after a change; the real-time hub and
//! any other subscriber receive it synchronously on the publishing thread.

mod bus;
mod event;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use event::{DomainEvent, DomainEventKind, EventContext, EventType};
