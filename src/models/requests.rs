//! Request DTOs for the optimizer admin API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

use crate::rules::RuleSpec;

/// Largest fan-out accepted by the performance test endpoint
pub const MAX_TEST_CONCURRENCY: usize = 1000;

/// Request body for tag invalidation (POST /cache/invalidate)
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    /// Tags whose entries should be purged
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InvalidateRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.tags.is_empty() {
            return Some("Tags array is required".to_string());
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Some("Tags cannot be empty".to_string());
        }
        None
    }
}

/// Request body for rule registration (POST /rules)
#[derive(Debug, Clone, Deserialize)]
pub struct AddRuleRequest {
    #[serde(flatten)]
    pub rule: RuleSpec,
}

impl AddRuleRequest {
    pub fn validate(&self) -> Option<String> {
        if self.rule.pattern.is_empty() {
            return Some("Pattern cannot be empty".to_string());
        }
        if !self.rule.pattern.starts_with('/') {
            return Some("Pattern must start with '/'".to_string());
        }
        None
    }
}

/// Request body for the load test (POST /test/performance)
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceTestRequest {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub dedupe: bool,
    #[serde(default = "default_concurrency")]
    pub concurrent_requests: usize,
    /// Simulated work per execution, in milliseconds
    #[serde(default = "default_work_ms")]
    pub work_ms: u64,
}

fn default_endpoint() -> String {
    "/api/test".to_string()
}

fn default_ttl() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    10
}

fn default_work_ms() -> u64 {
    100
}

impl PerformanceTestRequest {
    pub fn validate(&self) -> Option<String> {
        if !self.endpoint.starts_with('/') {
            return Some("Endpoint must start with '/'".to_string());
        }
        if self.concurrent_requests == 0 || self.concurrent_requests > MAX_TEST_CONCURRENCY {
            return Some(format!(
                "concurrent_requests must be between 1 and {}",
                MAX_TEST_CONCURRENCY
            ));
        }
        None
    }
}
