//! Operational endpoints: health, cache statistics, manual invalidation.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{ApiError, ErrorReport, codes};
use crate::cache::{CacheError, CacheStore, CacheWarmer};
use crate::realtime::RealtimeHub;

const SOURCE: &str = "infra::http::ops";

#[derive(Clone)]
pub struct OpsState {
    pub store: Arc<CacheStore>,
    pub hub: Arc<RealtimeHub>,
    pub warmer: Option<Arc<CacheWarmer>>,
}

/// `GET /health`, reachable without credentials.
pub fn health_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// The `/ops` surface.
pub fn ops_router(state: OpsState) -> Router {
    Router::new()
        .route("/ops/cache/stats", get(cache_stats))
        .route("/ops/cache/invalidate", post(invalidate_tags))
        .route("/ops/cache", axum::routing::delete(delete_by_pattern))
        .route("/ops/cache/warm", post(warm_now))
        .route("/ops/realtime", get(realtime_status))
        .with_state(state)
}

async fn health(State(state): State<OpsState>) -> Response {
    let pool = state.store.pool();
    if pool.is_healthy() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
    ErrorReport::from_message(
        "infra::http::health",
        StatusCode::SERVICE_UNAVAILABLE,
        pool.last_error()
            .unwrap_or_else(|| "backing store unhealthy".to_string()),
    )
    .attach(&mut response);
    response
}

async fn cache_stats(State(state): State<OpsState>) -> Response {
    Json(state.store.stats().await).into_response()
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    tags: Vec<String>,
}

async fn invalidate_tags(
    State(state): State<OpsState>,
    Json(body): Json<InvalidateRequest>,
) -> Response {
    let tags: Vec<String> = body
        .tags
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    if tags.is_empty() {
        return ApiError::bad_request("At least one tag is required", None).into_response();
    }
    if !state.store.config().enabled {
        return ApiError::cache_disabled().into_response();
    }

    let report = state.store.invalidate(&tags).await;
    info!(
        target = SOURCE,
        tags = report.tags,
        deleted = report.deleted_keys,
        failed = report.failed_tags.len(),
        "manual invalidation"
    );
    Json(report).into_response()
}

#[derive(Debug, Deserialize)]
struct PatternQuery {
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeletedBody {
    deleted: u64,
}

async fn delete_by_pattern(
    State(state): State<OpsState>,
    Query(query): Query<PatternQuery>,
) -> Response {
    let Some(pattern) = query
        .pattern
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
    else {
        return ApiError::bad_request(
            "Query parameter `pattern` is required",
            Some("e.g. ?pattern=resp:GET:/api/locations*".to_string()),
        )
        .into_response();
    };

    match state.store.delete_by_pattern(&pattern).await {
        Ok(deleted) => Json(DeletedBody { deleted }).into_response(),
        Err(CacheError::Disabled) => ApiError::cache_disabled().into_response(),
        Err(err) => ApiError::store_unavailable(Some(err.to_string())).into_response(),
    }
}

async fn warm_now(State(state): State<OpsState>) -> Response {
    let Some(warmer) = state
        .warmer
        .as_ref()
        .filter(|warmer| warmer.config().enabled)
    else {
        return ApiError::new(
            StatusCode::CONFLICT,
            codes::WARMER_DISABLED,
            "Cache warmer is disabled",
            None,
        )
        .into_response();
    };

    match warmer.warm_cycle().await {
        Some(report) => Json(report).into_response(),
        None => ApiError::new(
            StatusCode::CONFLICT,
            codes::WARM_IN_PROGRESS,
            "A warm cycle is already running",
            None,
        )
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct RealtimeStatus {
    connections: usize,
}

async fn realtime_status(State(state): State<OpsState>) -> Json<RealtimeStatus> {
    Json(RealtimeStatus {
        connections: state.hub.connection_count(),
    })
}
