mod error;
mod middleware;
mod ops;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, ErrorReport, codes};
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use ops::{OpsState, health_router, ops_router};

use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
};
use tracing::warn;

use super::auth::{TokenVerifier, authenticate, require_principal};
use crate::realtime;

/// Assemble the service router around the caller's application routes.
///
/// `app` carries the (cache-wrapped) read and write routes. The ops surface
/// requires a bearer token whenever any token is configured.
pub fn build_router(app: Router, ops: OpsState, verifier: Arc<dyn TokenVerifier>) -> Router {
    let mut ops_routes = ops_router(ops.clone());
    if verifier.has_credentials() {
        ops_routes = ops_routes.route_layer(from_fn(require_principal));
    } else {
        warn!(
            target = "shelfcache::http",
            "no credentials configured; /ops endpoints are unauthenticated"
        );
    }

    Router::new()
        .merge(health_router(ops.clone()))
        .merge(ops_routes)
        .merge(realtime::router(Arc::clone(&ops.hub)))
        .merge(app)
        .layer(from_fn_with_state(verifier, authenticate))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}
