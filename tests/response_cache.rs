mod support;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use shelfcache::cache::CacheConfig;
use shelfcache::realtime::RealtimeConfig;
use support::{
    ALICE_TOKEN, BOB_TOKEN, Inventory, authed_get, body_json, cache_config, context,
    context_with, get_request, header,
};
use tower::ServiceExt;

fn inventory() -> (shelfcache::cache::MemoryBackend, Inventory) {
    let (backend, ctx) = context();
    (backend, Inventory::new(Arc::new(ctx)))
}

#[tokio::test]
async fn first_read_misses_then_replays_from_cache() {
    let (_, app) = inventory();
    let router = app.router();

    let first = router
        .clone()
        .oneshot(get_request("/api/locations"))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache"), Some("MISS"));
    assert_eq!(header(&first, "x-cache-tags"), Some("locations"));
    let etag = header(&first, "etag").expect("etag").to_string();
    let first_body = body_json(first).await;

    let second = router
        .clone()
        .oneshot(get_request("/api/locations"))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-cache"), Some("HIT"));
    assert_eq!(header(&second, "etag"), Some(etag.as_str()));
    assert_eq!(header(&second, "content-type"), Some("application/json"));
    assert!(
        header(&second, "cache-control").is_some_and(|value| value.starts_with("public, max-age=")),
        "shared routes are publicly cacheable"
    );
    assert!(header(&second, "last-modified").is_some_and(|value| value.ends_with("GMT")));
    assert_eq!(body_json(second).await, first_body);
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn matching_if_none_match_yields_not_modified() {
    let (_, app) = inventory();
    let router = app.router();

    let first = router
        .clone()
        .oneshot(get_request("/api/locations/1"))
        .await
        .expect("response");
    let etag = header(&first, "etag").expect("etag").to_string();

    let conditional = Request::builder()
        .uri("/api/locations/1")
        .header("if-none-match", format!("W/{etag}"))
        .body(Body::empty())
        .expect("request");
    let response = router.oneshot(conditional).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&response, "x-cache"), Some("HIT"));
    assert_eq!(header(&response, "etag"), Some(etag.as_str()));
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn private_routes_are_partitioned_by_caller() {
    let (_, app) = inventory();
    let router = app.router();

    let alice = router
        .clone()
        .oneshot(authed_get("/api/me/summary", ALICE_TOKEN))
        .await
        .expect("response");
    assert_eq!(header(&alice, "x-cache"), Some("MISS"));
    assert_eq!(header(&alice, "vary"), Some("authorization"));
    assert!(header(&alice, "cache-control").is_some_and(|value| value.starts_with("private")));

    let alice_again = router
        .clone()
        .oneshot(authed_get("/api/me/summary", ALICE_TOKEN))
        .await
        .expect("response");
    assert_eq!(header(&alice_again, "x-cache"), Some("HIT"));
    assert_eq!(body_json(alice_again).await["subject"], "alice");

    let bob = router
        .clone()
        .oneshot(authed_get("/api/me/summary", BOB_TOKEN))
        .await
        .expect("response");
    assert_eq!(header(&bob, "x-cache"), Some("MISS"));
    assert_eq!(body_json(bob).await["subject"], "bob");

    let anonymous = router
        .oneshot(get_request("/api/me/summary"))
        .await
        .expect("response");
    assert_eq!(header(&anonymous, "x-cache"), Some("MISS"));
    assert_eq!(body_json(anonymous).await["subject"], "anonymous");
    assert_eq!(app.calls(), 3);
}

#[tokio::test]
async fn tag_invalidation_is_selective() {
    let (_, app) = inventory();
    let router = app.router();

    for uri in ["/api/locations", "/api/locations/1", "/api/locations/2"] {
        let response = router.clone().oneshot(get_request(uri)).await.expect("response");
        assert_eq!(header(&response, "x-cache"), Some("MISS"), "{uri}");
    }
    let tags = router
        .clone()
        .oneshot(get_request("/api/locations/1"))
        .await
        .expect("response");
    assert_eq!(header(&tags, "x-cache-tags"), Some("location:1,locations"));

    let report = app.context.store.invalidate(&["location:1"]).await;
    assert!(report.is_complete());
    assert_eq!(report.deleted_keys, 1);

    let expectations = [
        ("/api/locations/1", "MISS"),
        ("/api/locations/2", "HIT"),
        ("/api/locations", "HIT"),
    ];
    for (uri, expected) in expectations {
        let response = router.clone().oneshot(get_request(uri)).await.expect("response");
        assert_eq!(header(&response, "x-cache"), Some(expected), "{uri}");
    }
}

#[tokio::test]
async fn store_outage_fails_open() {
    let (backend, app) = inventory();
    let router = app.router();
    backend.set_online(false);

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(get_request("/api/locations"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-cache"), Some("MISS"));
        assert_eq!(body_json(response).await["locations"][0]["name"], "North");
    }
    assert_eq!(app.calls(), 3);
    assert!(!app.context.store.pool().is_healthy());

    backend.set_online(true);
    assert!(app.context.store.pool().ping().await);

    let refill = router
        .clone()
        .oneshot(get_request("/api/locations"))
        .await
        .expect("response");
    assert_eq!(header(&refill, "x-cache"), Some("MISS"));
    let hit = router
        .oneshot(get_request("/api/locations"))
        .await
        .expect("response");
    assert_eq!(header(&hit, "x-cache"), Some("HIT"));
}

#[tokio::test]
async fn client_no_cache_and_errors_bypass_storage() {
    let (_, app) = inventory();
    let router = app.router();

    let refuse = Request::builder()
        .uri("/api/locations")
        .header("cache-control", "no-cache")
        .body(Body::empty())
        .expect("request");
    let response = router.clone().oneshot(refuse).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), None);

    for _ in 0..2 {
        let missing = router
            .clone()
            .oneshot(get_request("/api/locations/99"))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&missing, "x-cache"), Some("MISS"));
    }
    assert_eq!(app.calls(), 3);
}

#[tokio::test]
async fn bypass_paths_and_disabled_cache_skip_the_store() {
    let (_, ctx) = context_with(
        CacheConfig {
            bypass_paths: vec!["/api/me".to_string()],
            ..cache_config()
        },
        RealtimeConfig::default(),
    );
    let app = Inventory::new(Arc::new(ctx));
    let router = app.router();
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(authed_get("/api/me/summary", ALICE_TOKEN))
            .await
            .expect("response");
        assert_eq!(header(&response, "x-cache"), None);
    }
    assert_eq!(app.calls(), 2);

    let (_, ctx) = context_with(
        CacheConfig {
            enabled: false,
            ..cache_config()
        },
        RealtimeConfig::default(),
    );
    let app = Inventory::new(Arc::new(ctx));
    let router = app.router();
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(get_request("/api/locations"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-cache"), None);
    }
    assert_eq!(app.calls(), 2);
}
