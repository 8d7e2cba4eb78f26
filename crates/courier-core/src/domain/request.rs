//! Request/response shapes passed to and returned from a remote executor.
//!
//! These are intentionally protocol-agnostic. Open-ended parts (headers, body)
//! are kept as plain maps / `serde_json::Value` so an HTTP, gRPC or in-process
//! executor can all interpret them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Description of one outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Verb understood by the executor (e.g. "GET", "POST", "invoke").
    pub method: String,

    /// Target of the call (URL, route, service method, ...).
    pub target: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Successful answer of a remote executor.
///
/// A response with a non-2xx status is still a response; executors that want
/// the classifier to see it as a failure return `RemoteError::Status` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl RemoteResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_headers_and_body_are_omitted() {
        let req = RequestDescriptor::get("https://example.test/items/1");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["method"], "GET");
        assert_eq!(v["target"], "https://example.test/items/1");
        assert!(v.get("headers").is_none());
        assert!(v.get("body").is_none());
    }

    #[test]
    fn builder_sets_headers_and_body() {
        let req = RequestDescriptor::new("POST", "/items")
            .with_header("x-tenant", "a")
            .with_body(serde_json::json!({"name": "n"}));
        assert_eq!(req.headers.get("x-tenant").map(String::as_str), Some("a"));
        assert_eq!(req.body.as_ref().unwrap()["name"], "n");
    }

    #[test]
    fn success_range_is_2xx() {
        assert!(RemoteResponse::ok().is_success());
        assert!(RemoteResponse::with_status(204).is_success());
        assert!(!RemoteResponse::with_status(301).is_success());
        assert!(!RemoteResponse::with_status(500).is_success());
    }
}
