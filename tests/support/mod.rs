#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use shelfcache::cache::{
    CacheConfig, CachePolicy, CacheStore, KvManager, MemoryBackend, Pool, PoolConfig, cached,
};
use shelfcache::context::ServiceContext;
use shelfcache::events::{DomainEvent, DomainEventKind};
use shelfcache::infra::auth::{StaticTokenVerifier, TokenVerifier};
use shelfcache::realtime::{RealtimeConfig, RealtimeHub};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const ALICE_TOKEN: &str = "secret-a";
pub const BOB_TOKEN: &str = "secret-b";

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        key_prefix: "test:".to_string(),
        default_ttl_ms: 60_000,
        tag_ttl_floor_ms: 120_000,
        ..CacheConfig::default()
    }
}

pub fn memory_store(config: CacheConfig) -> (MemoryBackend, Arc<CacheStore>) {
    let backend = MemoryBackend::new(NonZeroUsize::new(1_000).expect("capacity"));
    let manager: KvManager = Arc::new(backend.manager());
    let pool = Pool::new(
        manager,
        PoolConfig {
            min_size: 0,
            max_size: 4,
            acquire_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(60),
            validate_on_borrow: false,
        },
    );
    (backend, Arc::new(CacheStore::new(config, pool)))
}

pub fn context_with(config: CacheConfig, realtime: RealtimeConfig) -> (MemoryBackend, ServiceContext) {
    let (backend, store) = memory_store(config);
    let verifier: Arc<dyn TokenVerifier> = Arc::new(StaticTokenVerifier::new([
        ("alice", ALICE_TOKEN),
        ("bob", BOB_TOKEN),
    ]));
    let hub = Arc::new(RealtimeHub::new(realtime, Arc::clone(&verifier)));
    (
        backend,
        ServiceContext::from_parts(store, hub, None, verifier),
    )
}

pub fn context() -> (MemoryBackend, ServiceContext) {
    context_with(cache_config(), RealtimeConfig::default())
}

/// Minimal inventory service: cached reads over an in-memory table plus one
/// write route that invalidates and publishes.
#[derive(Clone)]
pub struct Inventory {
    pub context: Arc<ServiceContext>,
    pub locations: Arc<Mutex<BTreeMap<String, Value>>>,
    pub handler_calls: Arc<AtomicUsize>,
}

impl Inventory {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        let mut locations = BTreeMap::new();
        locations.insert("1".to_string(), json!({"id": "1", "name": "North"}));
        locations.insert("2".to_string(), json!({"id": "2", "name": "South"}));
        Self {
            context,
            locations: Arc::new(Mutex::new(locations)),
            handler_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.handler_calls.load(Ordering::SeqCst)
    }

    /// Application routes wrapped with the response cache.
    pub fn routes(&self) -> Router {
        let cache = self.context.cache_state();
        Router::new()
            .route(
                "/api/locations",
                cached(
                    get(list_locations),
                    &cache,
                    CachePolicy::new().shared().tags(["locations"]),
                ),
            )
            .route(
                "/api/locations/{id}",
                cached(
                    get(show_location),
                    &cache,
                    CachePolicy::new()
                        .shared()
                        .param_tags("locations", "location", "id"),
                )
                .post(rename_location),
            )
            .route(
                "/api/me/summary",
                cached(get(my_summary), &cache, CachePolicy::new().tags(["summary"])),
            )
            .route("/api/session", post(|| async { StatusCode::NO_CONTENT }))
            .with_state(self.clone())
    }

    /// Full service router around [`Inventory::routes`].
    pub fn router(&self) -> Router {
        self.context.router(self.routes())
    }
}

async fn list_locations(State(app): State<Inventory>) -> Json<Value> {
    app.handler_calls.fetch_add(1, Ordering::SeqCst);
    let locations = app.locations.lock().expect("locations lock");
    Json(json!({ "locations": locations.values().cloned().collect::<Vec<_>>() }))
}

async fn show_location(
    State(app): State<Inventory>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    app.handler_calls.fetch_add(1, Ordering::SeqCst);
    let locations = app.locations.lock().expect("locations lock");
    locations.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn my_summary(
    State(app): State<Inventory>,
    principal: Option<axum::Extension<shelfcache::infra::auth::Principal>>,
) -> Json<Value> {
    app.handler_calls.fetch_add(1, Ordering::SeqCst);
    let subject = principal.map_or_else(|| "anonymous".to_string(), |p| p.0.subject);
    Json(json!({ "subject": subject }))
}

async fn rename_location(
    State(app): State<Inventory>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let snapshot = {
        let mut locations = app.locations.lock().expect("locations lock");
        let entry = locations.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
        entry["name"] = body["name"].clone();
        entry.clone()
    };
    let event = DomainEvent::new(DomainEventKind::LocationChanged {
        location_id: id.clone(),
        snapshot: snapshot.clone(),
    });
    app.context
        .publish_change(&event, &["locations".to_string(), format!("location:{id}")])
        .await;
    Ok(Json(snapshot))
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

pub fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

/// Serve `router` on an ephemeral loopback port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server");
    });
    addr
}

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect_ws(addr: SocketAddr, token: &str) -> WsClient {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("websocket handshake");
    client
}

async fn next_message(client: &mut WsClient) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid frame");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

/// Next text frame, decoded as JSON. Pings are skipped.
pub async fn next_json(client: &mut WsClient) -> Value {
    match next_message(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Next close frame sent by the server.
pub async fn next_close(client: &mut WsClient) -> CloseFrame {
    match next_message(client).await {
        Message::Close(Some(frame)) => frame,
        other => panic!("expected a close frame, got {other:?}"),
    }
}

/// Poll until `check` holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
