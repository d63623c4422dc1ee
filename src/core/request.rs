//! Normalized request descriptor and the allow-side result of the pipeline.

use std::collections::HashMap;
use std::time::Duration;
use serde_json::Value;

/// Framework-independent view of an incoming request.
///
/// Header names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub remote_addr: Option<String>,
    /// Declared or observed body length in bytes
    pub content_length: u64,
    /// Query pairs in arrival order; a repeated key appears once per value
    pub query: Vec<(String, String)>,
    /// Parsed body, when there is one
    pub body: Option<Value>,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attach a JSON body and record its serialized length.
    pub fn with_body(mut self, body: Value) -> Self {
        self.content_length = body.to_string().len() as u64;
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// Remaining quota of the tightest limiter that admitted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Unix time (milliseconds) at which the oldest counted request leaves the window
    pub reset_at_ms: u64,
}

/// Outcome of a request the pipeline let through.
#[derive(Debug, Clone, PartialEq)]
pub struct Allowance {
    pub client_id: String,
    pub fingerprint: String,
    pub rate_limit: Option<RateLimitStatus>,
    /// Whether script markup was stripped from the payload
    pub sanitized: bool,
    /// Delay imposed before the request was allowed to continue
    pub throttled_for: Option<Duration>,
}

impl Allowance {
    /// `X-RateLimit-*` headers to attach to the response.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        match self.rate_limit {
            Some(status) => vec![
                ("X-RateLimit-Limit", status.limit.to_string()),
                ("X-RateLimit-Remaining", status.remaining.to_string()),
                ("X-RateLimit-Reset", (status.reset_at_ms / 1000).to_string()),
            ],
            None => Vec::new(),
        }
    }
}
