//! Connection registry, broadcast and heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::memo::PayloadMemo;
use crate::events::{DomainEvent, EventBus, SubscriptionId};
use crate::infra::auth::{Principal, TokenVerifier};

const SOURCE: &str = "realtime::hub";

/// Close code sent when the connect token is missing or rejected.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code sent to every client when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub path: String,
    pub heartbeat_interval: Duration,
    pub memo_ttl: Duration,
    pub send_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            memo_ttl: Duration::from_secs(5),
            send_buffer: 64,
        }
    }
}

impl From<&crate::config::RealtimeSettings> for RealtimeConfig {
    fn from(settings: &crate::config::RealtimeSettings) -> Self {
        Self {
            path: settings.path.clone(),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_seconds.get().into()),
            memo_ttl: Duration::from_millis(settings.memo_ttl_ms),
            send_buffer: settings.send_buffer.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What the writer half of a connection should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Utf8Bytes),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Resolves once the hub forgets a connection, whether it was reaped, removed
/// or closed on shutdown.
pub type Released = oneshot::Receiver<()>;

/// Per-connection record. `is_alive` is flipped by the heartbeat and by pongs.
#[derive(Debug)]
pub struct ConnectionState {
    pub principal: Principal,
    pub is_alive: bool,
    pub opened_at: OffsetDateTime,
    outbound: mpsc::Sender<Outbound>,
    // Dropped with the record, which resolves the connection's `Released`.
    _release: oneshot::Sender<()>,
}

#[derive(Debug, Serialize)]
struct ConnectedFrame {
    r#type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Connections whose queue was full; they miss this event.
    pub skipped: usize,
    /// Connections found closed and removed.
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub pinged: usize,
    pub reaped: usize,
}

/// Registry of open real-time connections.
pub struct RealtimeHub {
    config: RealtimeConfig,
    verifier: Arc<dyn TokenVerifier>,
    connections: DashMap<ConnectionId, ConnectionState>,
    memo: PayloadMemo,
    next_id: AtomicU64,
}

impl RealtimeHub {
    pub fn new(config: RealtimeConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            memo: PayloadMemo::new(config.memo_ttl),
            config,
            verifier,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Resolve a connect token to a principal.
    pub fn authenticate(&self, token: Option<&str>) -> Option<Principal> {
        token
            .filter(|token| !token.is_empty())
            .and_then(|token| self.verifier.verify(token))
    }

    /// Add a connection and queue its `connected` frame.
    pub fn register(&self, principal: Principal) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (id, rx, _) = self.register_session(principal);
        (id, rx)
    }

    /// [`RealtimeHub::register`] plus a signal that fires when the hub drops
    /// the connection, so the socket task can stop reading as well.
    pub fn register_session(
        &self,
        principal: Principal,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>, Released) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
        let (release, released) = oneshot::channel();

        let frame = ConnectedFrame {
            r#type: "connected",
            timestamp: OffsetDateTime::now_utc(),
            connection_id: id,
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                let _ = tx.try_send(Outbound::Frame(Utf8Bytes::from(json)));
            }
            Err(err) => error!(target = SOURCE, error = %err, "failed to encode connected frame"),
        }

        info!(target = SOURCE, connection = id.0, subject = %principal.subject, "real-time client connected");
        self.connections.insert(
            id,
            ConnectionState {
                principal,
                is_alive: true,
                opened_at: OffsetDateTime::now_utc(),
                outbound: tx,
                _release: release,
            },
        );
        self.report_size();
        (id, rx, released)
    }

    /// Record a pong.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(mut state) = self.connections.get_mut(&id) {
            state.is_alive = true;
        }
    }

    pub fn is_alive(&self, id: ConnectionId) -> Option<bool> {
        self.connections.get(&id).map(|state| state.is_alive)
    }

    /// Remove a connection; dropping its sender ends the writer.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(target = SOURCE, connection = id.0, "real-time client removed");
            self.report_size();
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn report_size(&self) {
        gauge!("shelfcache_realtime_connections").set(self.connections.len() as f64);
    }

    /// Push `event` to every connection with queue capacity.
    pub fn broadcast(&self, event: &DomainEvent) -> BroadcastOutcome {
        let payload = match self.memo.payload_for(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(target = SOURCE, event_id = %event.id, error = %err, "failed to encode event frame");
                return BroadcastOutcome::default();
            }
        };

        let mut outcome = BroadcastOutcome::default();
        let mut closed = Vec::new();
        for entry in self.connections.iter() {
            match entry.outbound.try_send(Outbound::Frame(payload.clone())) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(target = SOURCE, connection = entry.key().0, "send queue full; skipping event");
                    outcome.skipped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            if self.remove(id) {
                outcome.removed += 1;
            }
        }

        counter!("shelfcache_realtime_broadcast_total").increment(outcome.delivered as u64);
        debug!(
            target = SOURCE,
            event_type = event.event_type().as_str(),
            delivered = outcome.delivered,
            skipped = outcome.skipped,
            removed = outcome.removed,
            "event broadcast"
        );
        outcome
    }

    /// One heartbeat round: reap connections that missed the last ping, ping the rest.
    pub fn heartbeat_tick(&self) -> HeartbeatOutcome {
        let mut outcome = HeartbeatOutcome::default();
        let mut dead = Vec::new();
        for mut entry in self.connections.iter_mut() {
            if !entry.is_alive {
                dead.push(*entry.key());
                continue;
            }
            entry.is_alive = false;
            match entry.outbound.try_send(Outbound::Ping) {
                Ok(()) => outcome.pinged += 1,
                // A full queue still counts as pinged; a silent client is reaped next round.
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            if self.connections.remove(&id).is_some() {
                info!(target = SOURCE, connection = id.0, "terminating unresponsive real-time client");
                outcome.reaped += 1;
            }
        }
        if outcome.reaped > 0 {
            counter!("shelfcache_realtime_reaped_total").increment(outcome.reaped as u64);
            self.report_size();
        }
        self.memo.purge_expired();
        outcome
    }

    /// Drive [`RealtimeHub::heartbeat_tick`] at the configured interval.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let outcome = hub.heartbeat_tick();
                debug!(target = SOURCE, pinged = outcome.pinged, reaped = outcome.reaped, "heartbeat");
            }
        })
    }

    /// Forward every bus event to connected clients.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let hub = Arc::clone(self);
        bus.subscribe_all(move |event| {
            hub.broadcast(event);
        })
    }

    /// Ask every client to close and forget them.
    pub fn close_all(&self, reason: &'static str) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, state)) = self.connections.remove(&id) {
                let _ = state.outbound.try_send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason,
                });
                closed += 1;
            }
        }
        self.report_size();
        info!(target = SOURCE, closed, "real-time clients closed");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEventKind;
    use crate::infra::auth::StaticTokenVerifier;

    fn hub(send_buffer: usize) -> Arc<RealtimeHub> {
        let verifier = StaticTokenVerifier::new([("alice", "secret-a")]);
        Arc::new(RealtimeHub::new(
            RealtimeConfig {
                send_buffer,
                ..RealtimeConfig::default()
            },
            Arc::new(verifier),
        ))
    }

    fn principal() -> Principal {
        Principal::new("alice")
    }

    fn event() -> DomainEvent {
        DomainEvent::new(DomainEventKind::LocationChanged {
            location_id: "7".to_string(),
            snapshot: serde_json::Value::Null,
        })
    }

    #[test]
    fn tokens_are_checked_before_registration() {
        let hub = hub(4);
        assert_eq!(hub.authenticate(Some("secret-a")), Some(principal()));
        assert_eq!(hub.authenticate(Some("wrong")), None);
        assert_eq!(hub.authenticate(Some("")), None);
        assert_eq!(hub.authenticate(None), None);
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn register_queues_connected_frame() {
        let hub = hub(4);
        let (id, mut rx) = hub.register(principal());

        let Ok(Outbound::Frame(frame)) = rx.try_recv() else {
            panic!("expected connected frame");
        };
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).expect("json frame");
        assert_eq!(value["type"], "connected");
        assert_eq!(value["connection_id"], id.get());
        assert!(value["timestamp"].is_string());
        assert_eq!(hub.is_alive(id), Some(true));
    }

    #[test]
    fn broadcast_reaches_every_open_connection() {
        let hub = hub(4);
        let (_, mut first) = hub.register(principal());
        let (_, mut second) = hub.register(principal());
        first.try_recv().expect("connected");
        second.try_recv().expect("connected");

        let event = event();
        let outcome = hub.broadcast(&event);
        assert_eq!(outcome.delivered, 2);

        for rx in [&mut first, &mut second] {
            let Ok(Outbound::Frame(frame)) = rx.try_recv() else {
                panic!("expected event frame");
            };
            let value: serde_json::Value = serde_json::from_str(frame.as_str()).expect("json frame");
            assert_eq!(value["type"], "location-changed");
            assert_eq!(value["id"], event.id.to_string());
        }
    }

    #[test]
    fn full_queue_skips_and_closed_queue_removes() {
        let hub = hub(1);
        // The connected frame fills this queue.
        let (_, _full) = hub.register(principal());
        let (gone, gone_rx) = hub.register(principal());
        drop(gone_rx);

        let outcome = hub.broadcast(&event());
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(hub.is_alive(gone), None);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn silent_connection_is_reaped_on_second_tick() {
        let hub = hub(8);
        let (responsive, _rx_a) = hub.register(principal());
        let (silent, _rx_b) = hub.register(principal());

        let first = hub.heartbeat_tick();
        assert_eq!(first, HeartbeatOutcome { pinged: 2, reaped: 0 });
        assert_eq!(hub.is_alive(silent), Some(false));

        hub.mark_alive(responsive);
        let second = hub.heartbeat_tick();
        assert_eq!(second, HeartbeatOutcome { pinged: 1, reaped: 1 });
        assert_eq!(hub.is_alive(silent), None);
        assert_eq!(hub.is_alive(responsive), Some(false));
    }

    #[test]
    fn attached_hub_receives_bus_events() {
        let hub = hub(4);
        let bus = EventBus::new();
        let subscription = hub.attach(&bus);
        let (_, mut rx) = hub.register(principal());
        rx.try_recv().expect("connected");

        bus.publish(&event());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));

        assert!(bus.unsubscribe(subscription));
        bus.publish(&event());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_connection_releases_its_session() {
        let hub = hub(8);
        let (silent, _rx_a, silent_released) = hub.register_session(principal());
        let (leaving, _rx_b, leaving_released) = hub.register_session(principal());
        let (staying, _rx_c, mut staying_released) = hub.register_session(principal());

        hub.heartbeat_tick();
        hub.mark_alive(leaving);
        hub.mark_alive(staying);
        assert_eq!(hub.heartbeat_tick().reaped, 1);
        assert_eq!(hub.is_alive(silent), None);
        assert!(silent_released.await.is_err());

        assert!(hub.remove(leaving));
        assert!(leaving_released.await.is_err());

        assert!(matches!(
            staying_released.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(hub.close_all("server shutting down"), 1);
        assert!(staying_released.await.is_err());
    }

    #[test]
    fn close_all_sends_going_away() {
        let hub = hub(4);
        let (_, mut rx) = hub.register(principal());
        rx.try_recv().expect("connected");

        assert_eq!(hub.close_all("server shutting down"), 1);
        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down"
            })
        );
        assert_eq!(hub.connection_count(), 0);
    }
}
