//! WebSocket endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::hub::{CLOSE_AUTH_FAILED, ConnectionId, Outbound, RealtimeHub};
use crate::infra::auth::Principal;

const SOURCE: &str = "realtime::socket";

/// Upper bound on flushing and closing a socket the hub has let go of.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Router exposing the real-time channel at the configured path.
pub fn router(hub: Arc<RealtimeHub>) -> Router {
    let path = hub.config().path.clone();
    Router::new()
        .route(&path, get(realtime_handler))
        .with_state(hub)
}

pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<RealtimeHub>>,
) -> Response {
    match hub.authenticate(params.token.as_deref()) {
        Some(principal) => ws.on_upgrade(move |socket| serve_connection(socket, hub, principal)),
        None => {
            warn!(target = SOURCE, "rejecting real-time connection: authentication failed");
            ws.on_upgrade(reject)
        }
    }
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_AUTH_FAILED,
        reason: "authentication failed".into(),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        debug!(target = SOURCE, error = %err, "failed to send auth close frame");
    }
}

async fn serve_connection(socket: WebSocket, hub: Arc<RealtimeHub>, principal: Principal) {
    let (sink, stream) = socket.split();
    run_session(sink, stream, &hub, principal).await;
}

/// Pump one registered connection until either side ends or the hub drops it.
async fn run_session<S, R, E>(sink: S, stream: R, hub: &RealtimeHub, principal: Principal)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let (id, outbound, released) = hub.register_session(principal);
    let writer = write_loop(sink, outbound, id);
    tokio::pin!(writer);

    tokio::select! {
        _ = &mut writer => {}
        _ = read_loop(stream, hub, id) => {}
        _ = released => {
            // Reaped or shut down: flush what is queued, but never wait on a dead peer.
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                debug!(target = SOURCE, connection = id.get(), "peer stalled; abandoning socket");
            }
        }
    }
    hub.remove(id);
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>, id: ConnectionId)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    // Ends when the hub drops the sender (removal or reaping).
    while let Some(next) = outbound.recv().await {
        let (message, last) = match next {
            Outbound::Frame(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if let Err(err) = sink.send(message).await {
            debug!(target = SOURCE, connection = id.get(), error = %err, "write failed; dropping connection");
            return;
        }
        if last {
            return;
        }
    }
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!(target = SOURCE, connection = id.get(), "close handshake timed out");
    }
}

async fn read_loop<R, E>(mut stream: R, hub: &RealtimeHub, id: ConnectionId)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Pong(_)) => hub.mark_alive(id),
            Ok(Message::Close(_)) => {
                debug!(target = SOURCE, connection = id.get(), "client closed connection");
                return;
            }
            // Client messages carry no meaning on this channel.
            Ok(_) => {}
            Err(err) => {
                debug!(target = SOURCE, connection = id.get(), error = %err, "read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::infra::auth::StaticTokenVerifier;
    use crate::realtime::RealtimeConfig;

    /// A peer that never drains its receive buffer.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaped_session_ends_even_when_the_peer_stalls() {
        let verifier = StaticTokenVerifier::new([("alice", "secret-a")]);
        let hub = Arc::new(RealtimeHub::new(RealtimeConfig::default(), Arc::new(verifier)));

        let session = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move {
                let inbound = futures::stream::pending::<Result<Message, axum::Error>>();
                run_session(StalledSink, inbound, &hub, Principal::new("alice")).await;
            }
        });
        while hub.connection_count() == 0 {
            tokio::task::yield_now().await;
        }

        hub.heartbeat_tick();
        assert_eq!(hub.heartbeat_tick().reaped, 1);

        tokio::time::timeout(CLOSE_TIMEOUT * 2, session)
            .await
            .expect("session ends once reaped")
            .expect("session task joins");
        assert_eq!(hub.connection_count(), 0);
    }
}
