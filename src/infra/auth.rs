//! Bearer token verification.
//!
//! Token *policy* (issuance, scopes, expiry) lives outside this service; here
//! a token only resolves to the subject it was configured for. The resolved
//! [`Principal`] partitions private cache entries and identifies real-time
//! connections.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::http::ApiError;
use crate::config::AuthSettings;

const SOURCE: &str = "infra::auth";

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Resolves a bearer token to a principal. Must not block.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Principal>;

    /// Whether any token can verify at all.
    fn has_credentials(&self) -> bool {
        true
    }
}

/// Verifier over a fixed `subject → token` table.
///
/// Only SHA-256 digests are retained and every entry is compared in constant
/// time, so lookup cost does not depend on which entry (if any) matched.
pub struct StaticTokenVerifier {
    entries: Vec<([u8; 32], Principal)>,
}

impl StaticTokenVerifier {
    pub fn new<I, S, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(subject, token)| (digest(token.as_ref()), Principal::new(subject)))
                .collect(),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        if settings.tokens.is_empty() {
            warn!(
                target = SOURCE,
                "no auth tokens configured; real-time connections will be refused"
            );
        }
        Self::new(
            settings
                .tokens
                .iter()
                .map(|entry| (entry.subject.clone(), entry.token.as_str())),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<Principal> {
        let candidate = digest(token);
        let mut matched = None;
        for (expected, principal) in &self.entries {
            if bool::from(expected[..].ct_eq(&candidate[..])) && matched.is_none() {
                matched = Some(principal);
            }
        }
        matched.cloned()
    }

    fn has_credentials(&self) -> bool {
        !self.entries.is_empty()
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn bearer_token(request: &Request<Body>) -> Option<&str> {
    let value = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Resolve `Authorization: Bearer` into a [`Principal`] request extension.
///
/// Requests without the header pass through anonymously; a header carrying an
/// unknown token is rejected with `401`.
pub async fn authenticate(
    State(verifier): State<Arc<dyn TokenVerifier>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !request.headers().contains_key(AUTHORIZATION) {
        return next.run(request).await;
    }

    let principal = bearer_token(&request).and_then(|token| verifier.verify(token));
    match principal {
        Some(principal) => {
            debug!(target = SOURCE, subject = %principal.subject, "request authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => ApiError::unauthorized().into_response(),
    }
}

/// Reject requests that `authenticate` left anonymous.
pub async fn require_principal(request: Request<Body>, next: Next) -> Response {
    if request.extensions().get::<Principal>().is_none() {
        return ApiError::unauthorized().into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, http::StatusCode, middleware::from_fn_with_state, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn verifier() -> Arc<dyn TokenVerifier> {
        Arc::new(StaticTokenVerifier::new([
            ("alice", "secret-a"),
            ("bob", "secret-b"),
        ]))
    }

    fn app() -> Router {
        async fn whoami(principal: Option<Extension<Principal>>) -> String {
            principal.map_or_else(|| "anonymous".to_string(), |Extension(p)| p.subject)
        }
        Router::new()
            .route("/whoami", get(whoami))
            .layer(from_fn_with_state(verifier(), authenticate))
    }

    async fn call(app: Router, auth: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/whoami");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn verifies_known_tokens_only() {
        let verifier = verifier();
        assert_eq!(verifier.verify("secret-b"), Some(Principal::new("bob")));
        assert_eq!(verifier.verify("secret-c"), None);
        assert_eq!(verifier.verify(""), None);
        assert!(verifier.has_credentials());
        assert!(!StaticTokenVerifier::new(Vec::<(String, String)>::new()).has_credentials());
    }

    #[tokio::test]
    async fn bearer_header_resolves_principal() {
        assert_eq!(
            call(app(), Some("Bearer secret-a")).await,
            (StatusCode::OK, "alice".to_string())
        );
        assert_eq!(
            call(app(), Some("bearer secret-b")).await,
            (StatusCode::OK, "bob".to_string())
        );
    }

    #[tokio::test]
    async fn missing_header_passes_through_anonymously() {
        assert_eq!(
            call(app(), None).await,
            (StatusCode::OK, "anonymous".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_or_malformed_token_is_rejected() {
        let (status, body) = call(app(), Some("Bearer nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("unauthorized"));

        let (status, _) = call(app(), Some("Basic secret-a")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
