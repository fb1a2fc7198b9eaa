//! Request Descriptor Module
//!
//! The transport-independent shape of an inbound request, and the stable
//! cache/dedup key derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Headers that distinguish otherwise identical requests.
pub const RELEVANT_HEADERS: [&str; 4] = ["authorization", "x-user-id", "x-tenant-id", "accept-language"];

// == Request Descriptor ==
/// What the optimizer needs to know about a request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method, upper-cased
    pub method: String,
    /// Path without the query string
    pub path: String,
    /// Query parameters
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Relevant headers, lower-cased names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body; ignored for GET
    #[serde(default)]
    pub body: Option<Value>,
}

/// Borrowed canonical form that gets hashed.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    method: &'a str,
    path: &'a str,
    query: &'a BTreeMap<String, String>,
    headers: BTreeMap<&'a str, &'a str>,
    body: Option<&'a Value>,
}

impl RequestDescriptor {
    // == Constructors ==
    pub fn new(method: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Adds a header. Names are stored lower-cased.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    // == Cache Key ==
    /// Stable key: `METHOD:path:sha256(canonical form)`.
    ///
    /// The canonical form sorts query parameters and relevant headers, keeps
    /// only [`RELEVANT_HEADERS`], and drops the body of GET requests. JSON
    /// object keys inside the body are sorted by `serde_json`'s map.
    pub fn cache_key(&self) -> String {
        let canonical = CanonicalRequest {
            method: &self.method,
            path: &self.path,
            query: &self.query,
            headers: self
                .headers
                .iter()
                .filter(|(name, _)| RELEVANT_HEADERS.contains(&name.as_str()))
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect(),
            body: if self.method == "GET" {
                None
            } else {
                self.body.as_ref()
            },
        };

        // Serializing maps of strings and a JSON value cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        format!("{}:{}:{}", self.method, self.path, hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_has_method_and_path_prefix() {
        let key = RequestDescriptor::get("/api/stats").cache_key();
        assert!(key.starts_with("GET:/api/stats:"));
        assert_eq!(key.len(), "GET:/api/stats:".len() + 64);
    }

    #[test]
    fn test_query_order_does_not_matter() {
        let a = RequestDescriptor::get("/x").with_query("a", "1").with_query("b", "2");
        let b = RequestDescriptor::get("/x").with_query("b", "2").with_query("a", "1");
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_irrelevant_headers_are_ignored() {
        let a = RequestDescriptor::get("/x").with_header("User-Agent", "curl");
        let b = RequestDescriptor::get("/x").with_header("User-Agent", "firefox");
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_relevant_headers_split_keys() {
        let a = RequestDescriptor::get("/x").with_header("X-User-Id", "1");
        let b = RequestDescriptor::get("/x").with_header("x-user-id", "2");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.header("X-USER-ID"), Some("1"));
    }

    #[test]
    fn test_body_only_counts_for_non_get() {
        let get_a = RequestDescriptor::get("/x").with_body(json!({"q": 1}));
        let get_b = RequestDescriptor::get("/x").with_body(json!({"q": 2}));
        assert_eq!(get_a.cache_key(), get_b.cache_key());

        let post_a = RequestDescriptor::new("post", "/x").with_body(json!({"q": 1}));
        let post_b = RequestDescriptor::new("POST", "/x").with_body(json!({"q": 2}));
        assert_ne!(post_a.cache_key(), post_b.cache_key());
    }

    #[test]
    fn test_body_key_order_is_canonical() {
        let a = RequestDescriptor::new("POST", "/x").with_body(json!({"a": 1, "b": 2}));
        let b = RequestDescriptor::new("POST", "/x")
            .with_body(serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap());
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
