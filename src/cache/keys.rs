//! Cache key and ETag derivation.
//!
//! Both are SHA-256 content hashes over a canonical JSON form: object keys are
//! sorted recursively and arrays are sorted after their elements have been
//! normalized, so semantically identical requests and responses hash the same
//! regardless of property or element order.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Namespace every response key starts with.
pub const RESPONSE_NAMESPACE: &str = "resp";

const DIGEST_HEX_LEN: usize = 32;

/// Caller partition a cached response belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Responses explicitly marked cacheable across users.
    Shared,
    /// Caller-private responses keyed by the authenticated subject.
    Caller(String),
    /// Caller-private responses for requests without an identity.
    Anonymous,
}

impl Scope {
    fn key_part(&self) -> String {
        match self {
            Scope::Shared => "shared".to_string(),
            Scope::Caller(subject) => format!("caller:{subject}"),
            Scope::Anonymous => "anonymous".to_string(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Scope::Shared)
    }
}

/// Normalized request shape a cache key is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFingerprint {
    method: String,
    path: String,
    query: Value,
    body: Option<Value>,
    scope: Scope,
    vary: BTreeMap<String, String>,
}

impl RequestFingerprint {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: Value::Object(Map::new()),
            body: None,
            scope: Scope::Anonymous,
            vary: BTreeMap::new(),
        }
    }

    /// Attach the raw (undecoded) query string.
    pub fn with_query(mut self, raw: Option<&str>) -> Self {
        self.query = raw.map(query_value).unwrap_or_else(|| Value::Object(Map::new()));
        self
    }

    /// Attach a request body. Ignored for GET and HEAD, whose bodies carry no meaning.
    pub fn with_body(mut self, body: Value) -> Self {
        if self.method != "GET" && self.method != "HEAD" {
            self.body = Some(body);
        }
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Record the value of a whitelisted vary header. Names are case-insensitive.
    pub fn with_vary(mut self, name: &str, value: &str) -> Self {
        self.vary
            .insert(name.to_ascii_lowercase(), value.trim().to_string());
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Deterministic key: `resp:<METHOD>:<path>:<digest>`.
    ///
    /// Method and path stay readable so pattern deletion such as
    /// `resp:GET:/api/locations*` can target a route.
    pub fn cache_key(&self) -> String {
        let material = json!({
            "method": self.method,
            "path": self.path,
            "query": self.query,
            "body": self.body,
            "scope": self.scope.key_part(),
            "vary": self.vary,
        });
        let digest = content_hash(&material);
        format!(
            "{RESPONSE_NAMESPACE}:{}:{}:{}",
            self.method,
            self.path,
            &digest[..DIGEST_HEX_LEN]
        )
    }
}

/// Decode a query string into a JSON object of sorted value lists.
pub fn query_value(raw: &str) -> Value {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url::form_urlencoded::parse(raw.trim_start_matches('?').as_bytes()) {
        if name.is_empty() {
            continue;
        }
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    for values in params.values_mut() {
        values.sort();
    }
    serde_json::to_value(params).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Recursively sort object keys and array elements.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::with_capacity(sorted.len());
            for (key, value) in sorted {
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut normalized: Vec<(String, Value)> = items
                .iter()
                .map(|item| {
                    let item = canonicalize(item);
                    (item.to_string(), item)
                })
                .collect();
            normalized.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(normalized.into_iter().map(|(_, item)| item).collect())
        }
        other => other.clone(),
    }
}

/// Hex SHA-256 of the canonical form of `value`.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Strong ETag (quoted) for a response body.
pub fn etag_for(body: &Value) -> String {
    format!("\"{}\"", &content_hash(body)[..DIGEST_HEX_LEN])
}

/// Evaluate an `If-None-Match` header against a stored ETag.
///
/// Uses weak comparison as required for `If-None-Match`, so `W/"x"` matches `"x"`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let wanted = strip_weak(etag.trim());
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == wanted)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locations(query: &str) -> RequestFingerprint {
        RequestFingerprint::new("get", "/api/locations")
            .with_query(Some(query))
            .with_scope(Scope::Caller("alice".to_string()))
    }

    #[test]
    fn query_order_does_not_change_key() {
        assert_eq!(
            locations("b=2&a=1&a=0").cache_key(),
            locations("a=0&b=2&a=1").cache_key()
        );
    }

    #[test]
    fn key_keeps_method_and_path_readable() {
        let key = locations("").cache_key();
        assert!(key.starts_with("resp:GET:/api/locations:"));
    }

    #[test]
    fn every_dimension_changes_the_key() {
        let base = locations("a=1");
        let base_key = base.cache_key();

        assert_ne!(base_key, locations("a=2").cache_key());
        assert_ne!(
            base_key,
            RequestFingerprint::new("GET", "/api/items")
                .with_query(Some("a=1"))
                .with_scope(Scope::Caller("alice".to_string()))
                .cache_key()
        );
        assert_ne!(
            base_key,
            base.clone()
                .with_scope(Scope::Caller("bob".to_string()))
                .cache_key()
        );
        assert_ne!(base_key, base.clone().with_scope(Scope::Shared).cache_key());
        assert_ne!(
            base_key,
            base.clone().with_vary("Accept-Language", "de").cache_key()
        );
    }

    #[test]
    fn vary_header_names_are_case_insensitive() {
        let upper = locations("").with_vary("X-Region", "eu");
        let lower = locations("").with_vary("x-region", "eu");
        assert_eq!(upper.cache_key(), lower.cache_key());
    }

    #[test]
    fn body_only_counts_for_non_get() {
        let get_a = RequestFingerprint::new("GET", "/api/report").with_body(json!({"a": 1}));
        let get_b = RequestFingerprint::new("GET", "/api/report").with_body(json!({"a": 2}));
        assert_eq!(get_a.cache_key(), get_b.cache_key());

        let post_a = RequestFingerprint::new("POST", "/api/report")
            .with_body(json!({"filters": {"x": 1, "y": [3, 1]}}));
        let post_b = RequestFingerprint::new("POST", "/api/report")
            .with_body(json!({"filters": {"y": [1, 3], "x": 1}}));
        let post_c = RequestFingerprint::new("POST", "/api/report")
            .with_body(json!({"filters": {"x": 2}}));
        assert_eq!(post_a.cache_key(), post_b.cache_key());
        assert_ne!(post_a.cache_key(), post_c.cache_key());
    }

    #[test]
    fn canonicalize_sorts_nested_structures() {
        let left = json!({"b": [{"z": 1, "a": 2}, 3], "a": null});
        let right = json!({"a": null, "b": [3, {"a": 2, "z": 1}]});
        assert_eq!(canonicalize(&left), canonicalize(&right));
        assert_eq!(content_hash(&left), content_hash(&right));
    }

    #[test]
    fn etag_is_deterministic_and_content_sensitive() {
        let body = json!({"items": [{"sku": "A-1", "qty": 4}]});
        assert_eq!(etag_for(&body), etag_for(&body.clone()));
        assert_ne!(
            etag_for(&body),
            etag_for(&json!({"items": [{"sku": "A-1", "qty": 5}]}))
        );
        assert!(etag_for(&body).starts_with('"') && etag_for(&body).ends_with('"'));
    }

    #[test]
    fn if_none_match_handles_lists_weak_tags_and_wildcard() {
        let etag = "\"abc\"";
        assert!(etag_matches("\"abc\"", etag));
        assert!(etag_matches("\"zzz\", W/\"abc\"", etag));
        assert!(etag_matches("*", etag));
        assert!(!etag_matches("\"abd\"", etag));
    }
}
