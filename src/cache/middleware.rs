//! Response cache middleware.
//!
//! Wraps individual read routes. GET requests are keyed by method, path,
//! normalized query, caller scope and the route's vary headers; hits replay
//! the stored JSON body (or `304` on a matching `If-None-Match`), misses run
//! the handler and store a successful JSON response under the route's tags.
//! When the backing store is unavailable the handler runs uncached and the
//! response is marked `X-Cache: MISS`; the request itself never fails because
//! of the cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRequestParts, RawPathParams, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{
            AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
            LAST_MODIFIED, SET_COOKIE, VARY,
        },
        request::Parts,
    },
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use futures::FutureExt;
use http_body_util::BodyExt;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::{debug, instrument, warn};

use super::keys::{RequestFingerprint, Scope, etag_matches};
use super::record::CacheRecord;
use super::store::CacheStore;
use crate::infra::auth::Principal;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_TTL: HeaderName = HeaderName::from_static("x-cache-ttl");
pub const X_CACHE_TAGS: HeaderName = HeaderName::from_static("x-cache-tags");

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub store: Arc<CacheStore>,
}

impl CacheState {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }
}

// ============================================================================
// Route policy
// ============================================================================

/// Computes tags from the request being cached.
pub type TagFn = Arc<dyn Fn(&RequestShape) -> Vec<String> + Send + Sync>;

/// Where a route's invalidation tags come from.
#[derive(Clone)]
pub enum TagSource {
    Static(Vec<String>),
    FromRequest(TagFn),
}

impl fmt::Debug for TagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagSource::Static(tags) => f.debug_tuple("Static").field(tags).finish(),
            TagSource::FromRequest(_) => f.write_str("FromRequest(..)"),
        }
    }
}

/// Per-route caching rules.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Falls back to the configured default TTL when unset.
    pub ttl: Option<Duration>,
    pub shared_across_users: bool,
    pub vary_by_headers: Vec<HeaderName>,
    pub tags: TagSource,
    pub enabled: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: None,
            shared_across_users: false,
            vary_by_headers: Vec::new(),
            tags: TagSource::Static(Vec::new()),
            enabled: true,
        }
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache one copy for every caller instead of one per identity.
    pub fn shared(mut self) -> Self {
        self.shared_across_users = true;
        self
    }

    pub fn vary_by(mut self, header: HeaderName) -> Self {
        self.vary_by_headers.push(header);
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = TagSource::Static(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags_from<F>(mut self, compute: F) -> Self
    where
        F: Fn(&RequestShape) -> Vec<String> + Send + Sync + 'static,
    {
        self.tags = TagSource::FromRequest(Arc::new(compute));
        self
    }

    /// Tag with a collection tag plus `<entity_prefix>:<value of param>`.
    ///
    /// `param_tags("resource:locations", "resource:location", "id")` on
    /// `/api/locations/7` yields `resource:locations` and `resource:location:7`.
    pub fn param_tags(self, collection: &str, entity_prefix: &str, param: &str) -> Self {
        let collection = collection.to_string();
        let entity_prefix = entity_prefix.to_string();
        let param = param.to_string();
        self.tags_from(move |shape| {
            let mut tags = vec![collection.clone()];
            if let Some(value) = shape.path_param(&param) {
                tags.push(format!("{entity_prefix}:{value}"));
            }
            tags
        })
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn resolve_tags(&self, shape: &RequestShape) -> Vec<String> {
        let mut tags = match &self.tags {
            TagSource::Static(tags) => tags.clone(),
            TagSource::FromRequest(compute) => compute(shape),
        };
        tags.sort();
        tags.dedup();
        tags
    }

    fn vary_header(&self) -> Option<String> {
        let mut names: Vec<&str> = Vec::new();
        if !self.shared_across_users {
            names.push(AUTHORIZATION.as_str());
        }
        names.extend(self.vary_by_headers.iter().map(HeaderName::as_str));
        (!names.is_empty()).then(|| names.join(", "))
    }
}

/// Request data available to tag functions.
#[derive(Debug, Clone)]
pub struct RequestShape {
    method: Method,
    path: String,
    query: Option<String>,
    params: Vec<(String, String)>,
    headers: HeaderMap,
}

impl RequestShape {
    async fn from_parts(parts: &mut Parts) -> Self {
        let no_state = ();
        let params = match RawPathParams::from_request_parts(parts, &no_state).await {
            Ok(raw) => raw
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            Err(_) => Vec::new(),
        };
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            params,
            headers: parts.headers.clone(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First value of a query parameter, decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Wrap a read route with the response cache.
pub fn cached<S>(route: MethodRouter<S>, cache: &CacheState, policy: CachePolicy) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    let state = RouteCache {
        cache: cache.clone(),
        policy: Arc::new(policy),
    };
    route.route_layer(from_fn_with_state(state, response_cache_layer))
}

/// Middleware state: shared cache plus the wrapped route's policy.
#[derive(Clone)]
pub struct RouteCache {
    cache: CacheState,
    policy: Arc<CachePolicy>,
}

// ============================================================================
// Middleware
// ============================================================================

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(route): State<RouteCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let RouteCache { cache, policy } = route;
    let store = &cache.store;

    if let Some(reason) = bypass_reason(store, &policy, &request) {
        debug!(cache = "response", outcome = "bypass", reason);
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let shape = RequestShape::from_parts(&mut parts).boxed().await;
    let principal = parts.extensions.get::<Principal>().cloned();
    let if_none_match = parts
        .headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = Request::from_parts(parts, body);

    if !store.is_enabled() {
        debug!(cache = "response", outcome = "unavailable");
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
        return response;
    }

    let scope = if policy.shared_across_users {
        Scope::Shared
    } else {
        principal.map_or(Scope::Anonymous, |principal| Scope::Caller(principal.subject))
    };
    let mut fingerprint = RequestFingerprint::new(shape.method.as_str(), &shape.path)
        .with_query(shape.query.as_deref())
        .with_scope(scope);
    for name in &policy.vary_by_headers {
        fingerprint = fingerprint.with_vary(name.as_str(), shape.header(name).unwrap_or(""));
    }
    let key = fingerprint.cache_key();

    if let Some(record) = store.get(&key).await {
        if let Some(response) = replay(&record, if_none_match.as_deref(), &policy) {
            debug!(cache = "response", outcome = "hit", key = %key);
            return response;
        }
    }

    debug!(cache = "response", outcome = "miss", key = %key);
    let response = next.run(request).await;
    let ttl = policy.ttl.unwrap_or_else(|| store.config().default_ttl());
    let tags = policy.resolve_tags(&shape);
    capture(store, key, ttl, tags, &policy, response).boxed().await
}

fn bypass_reason(store: &CacheStore, policy: &CachePolicy, request: &Request<Body>) -> Option<&'static str> {
    if !store.config().enabled {
        return Some("disabled");
    }
    if !policy.enabled {
        return Some("policy");
    }
    if request.method() != Method::GET {
        return Some("method");
    }
    if store.config().bypasses(request.uri().path()) {
        return Some("bypass_path");
    }
    let client_refuses = request
        .headers()
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| has_directive(value, "no-cache") || has_directive(value, "no-store"));
    client_refuses.then_some("client_no_cache")
}

fn has_directive(cache_control: &str, directive: &str) -> bool {
    cache_control
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(directive))
}

/// Decide whether a handler response may be stored.
fn should_store_response(response: &Response, max_body_bytes: usize) -> bool {
    if !response.status().is_success() {
        return false;
    }
    let headers = response.headers();
    if headers.contains_key(SET_COOKIE) {
        return false;
    }
    if headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| has_directive(value, "no-store"))
    {
        return false;
    }
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            let mime = value.split(';').next().unwrap_or("").trim();
            mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json")
        });
    if !is_json {
        return false;
    }
    let declared_len = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    declared_len.is_none_or(|len| len <= max_body_bytes)
}

async fn capture(
    store: &CacheStore,
    key: String,
    ttl: Duration,
    tags: Vec<String>,
    policy: &CachePolicy,
    response: Response,
) -> Response {
    let max_body_bytes = store.config().max_body_bytes;
    if !should_store_response(&response, max_body_bytes) {
        return mark_miss(response);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(cache = "response", error = %err, "failed to buffer handler response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if bytes.len() > max_body_bytes {
        debug!(cache = "response", size = bytes.len(), "response too large to cache");
        return mark_miss(Response::from_parts(parts, Body::from(bytes)));
    }
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            debug!(cache = "response", error = %err, "response body is not valid JSON");
            return mark_miss(Response::from_parts(parts, Body::from(bytes)));
        }
    };

    let mut record = CacheRecord::new(key.clone(), parts.status.as_u16(), value, ttl, tags);
    if let Some(content_type) = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        record = record.with_content_type(content_type);
    }

    match store.set(&key, &record).await {
        Ok(()) => debug!(cache = "response", key = %key, tags = record.tags.len(), "response cached"),
        Err(err) => debug!(cache = "response", key = %key, error = %err, "response not cached"),
    }

    annotate(&mut parts.headers, &record, "MISS", record.ttl(), policy);
    Response::from_parts(parts, Body::from(bytes))
}

/// Build the response for a hit, or `None` when the record cannot be replayed.
fn replay(record: &CacheRecord, if_none_match: Option<&str>, policy: &CachePolicy) -> Option<Response> {
    let status = StatusCode::from_u16(record.status_code).ok()?;
    let remaining = record.remaining_ttl(OffsetDateTime::now_utc());

    if if_none_match.is_some_and(|value| etag_matches(value, &record.etag)) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        annotate(response.headers_mut(), record, "HIT", remaining, policy);
        return Some(response);
    }

    let body = match serde_json::to_vec(&record.body) {
        Ok(body) => body,
        Err(err) => {
            warn!(cache = "response", key = %record.key, error = %err, "cached body could not be encoded");
            return None;
        }
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let content_type = record
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    annotate(response.headers_mut(), record, "HIT", remaining, policy);
    Some(response)
}

fn mark_miss(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    response
}

fn annotate(
    headers: &mut HeaderMap,
    record: &CacheRecord,
    outcome: &'static str,
    remaining: Duration,
    policy: &CachePolicy,
) {
    let visibility = if policy.shared_across_users {
        "public"
    } else {
        "private"
    };
    let max_age = remaining.as_secs();

    headers.insert(X_CACHE, HeaderValue::from_static(outcome));
    headers.insert(X_CACHE_TTL, HeaderValue::from(max_age));
    if let Ok(value) = HeaderValue::from_str(&format!("{visibility}, max-age={max_age}")) {
        headers.insert(CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.etag) {
        headers.insert(ETAG, value);
    }
    if !record.tags.is_empty() {
        let joined = record.tags.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(X_CACHE_TAGS, value);
        }
    }
    if let Some(value) = policy
        .vary_header()
        .and_then(|vary| HeaderValue::from_str(&vary).ok())
    {
        headers.insert(VARY, value);
    }
    if let Some(value) = http_date(record.stored_at).and_then(|date| HeaderValue::from_str(&date).ok()) {
        headers.insert(LAST_MODIFIED, value);
    }
}

fn http_date(at: OffsetDateTime) -> Option<String> {
    at.to_offset(time::UtcOffset::UTC).format(HTTP_DATE).ok()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn json_response(status: StatusCode) -> Response {
        let mut response = Response::new(Body::from("{}"));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        response
    }

    #[test]
    fn only_successful_json_responses_are_stored() {
        assert!(should_store_response(&json_response(StatusCode::OK), 1024));
        assert!(!should_store_response(&json_response(StatusCode::NOT_FOUND), 1024));

        let mut with_cookie = json_response(StatusCode::OK);
        with_cookie
            .headers_mut()
            .insert(SET_COOKIE, HeaderValue::from_static("session=abc"));
        assert!(!should_store_response(&with_cookie, 1024));

        let mut no_store = json_response(StatusCode::OK);
        no_store
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
        assert!(!should_store_response(&no_store, 1024));

        let mut html = json_response(StatusCode::OK);
        html.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(!should_store_response(&html, 1024));

        let mut large = json_response(StatusCode::OK);
        large
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));
        assert!(!should_store_response(&large, 1024));
    }

    #[test]
    fn param_tags_include_collection_and_entity() {
        let policy = CachePolicy::new().param_tags("resource:locations", "resource:location", "id");
        let shape = RequestShape {
            method: Method::GET,
            path: "/api/locations/7".to_string(),
            query: None,
            params: vec![("id".to_string(), "7".to_string())],
            headers: HeaderMap::new(),
        };
        assert_eq!(
            policy.resolve_tags(&shape),
            vec!["resource:location:7".to_string(), "resource:locations".to_string()]
        );
    }

    #[test]
    fn query_params_are_decoded() {
        let shape = RequestShape {
            method: Method::GET,
            path: "/api/items".to_string(),
            query: Some("location=north%20wing&sort=name".to_string()),
            params: Vec::new(),
            headers: HeaderMap::new(),
        };
        assert_eq!(shape.query_param("location").as_deref(), Some("north wing"));
        assert_eq!(shape.query_param("missing"), None);
    }

    #[test]
    fn vary_lists_identity_only_for_private_routes() {
        let private = CachePolicy::new().vary_by(HeaderName::from_static("accept-language"));
        assert_eq!(
            private.vary_header().as_deref(),
            Some("authorization, accept-language")
        );
        assert_eq!(CachePolicy::new().shared().vary_header(), None);
    }

    #[test]
    fn annotate_sets_cache_headers() {
        let mut record = CacheRecord::new(
            "resp:GET:/a:1",
            200,
            json!({"a": 1}),
            Duration::from_secs(900),
            ["resource:a", "resource:b"],
        );
        record.stored_at = datetime!(2024-03-05 08:09:10 UTC);

        let mut headers = HeaderMap::new();
        annotate(
            &mut headers,
            &record,
            "HIT",
            Duration::from_secs(120),
            &CachePolicy::new().shared(),
        );

        assert_eq!(headers[X_CACHE], "HIT");
        assert_eq!(headers[X_CACHE_TTL], "120");
        assert_eq!(headers[X_CACHE_TAGS], "resource:a,resource:b");
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=120");
        assert_eq!(headers[ETAG], record.etag.as_str());
        assert_eq!(headers[LAST_MODIFIED], "Tue, 05 Mar 2024 08:09:10 GMT");
    }

    #[test]
    fn not_modified_when_etag_matches() {
        let record = CacheRecord::new(
            "resp:GET:/a:1",
            200,
            json!({"a": 1}),
            Duration::from_secs(60),
            Vec::<String>::new(),
        );
        let policy = CachePolicy::new();

        let fresh = replay(&record, Some(&record.etag), &policy).expect("replayable");
        assert_eq!(fresh.status(), StatusCode::NOT_MODIFIED);

        let full = replay(&record, Some("\"other\""), &policy).expect("replayable");
        assert_eq!(full.status(), StatusCode::OK);
        assert_eq!(full.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn replay_survives_an_unbounded_ttl() {
        let record = CacheRecord::new(
            "resp:GET:/a:1",
            200,
            json!({"a": 1}),
            Duration::MAX,
            Vec::<String>::new(),
        );

        let response = replay(&record, None, &CachePolicy::new()).expect("replayable");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CACHE], "HIT");
    }
}
