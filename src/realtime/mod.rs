//! Real-time fan-out over WebSocket.
//!
//! Clients connect to the configured path with `?token=<bearer>`. Every event
//! published on the [`EventBus`](crate::events::EventBus) is serialized once
//! and queued to each open connection. A heartbeat pings clients at a fixed
//! interval and terminates any that did not answer the previous ping.

mod hub;
mod memo;
mod socket;

pub use hub::{
    BroadcastOutcome, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, ConnectionId, ConnectionState,
    HeartbeatOutcome, Outbound, RealtimeConfig, RealtimeHub, Released,
};
pub use memo::PayloadMemo;
pub use socket::{ConnectParams, realtime_handler, router};
