//! Response DTOs for the optimizer admin API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::Priority;
use crate::optimizer::{ClearResult, InvalidationResult, LoadTestReport, MetricsSnapshot};
use crate::rules::OptimizationRule;

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    pub service: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
    pub metrics: MetricsSnapshot,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(metrics: MetricsSnapshot) -> Self {
        Self {
            status: "healthy".to_string(),
            service: "request-optimizer".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metrics,
        }
    }
}

/// Response body for the metrics endpoint (GET /metrics)
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub timestamp: String,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

impl MetricsResponse {
    pub fn new(metrics: MetricsSnapshot) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            metrics,
        }
    }
}

/// Response body for tag invalidation (POST /cache/invalidate)
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub message: String,
    pub tags: Vec<String>,
    pub total_invalidated: usize,
}

impl From<InvalidationResult> for InvalidateResponse {
    fn from(result: InvalidationResult) -> Self {
        Self {
            message: "Cache invalidated successfully".to_string(),
            tags: result.tags,
            total_invalidated: result.total_invalidated,
        }
    }
}

/// Response body for POST /cache/clear
#[derive(Debug, Clone, Serialize)]
pub struct ClearResponse {
    pub message: String,
    pub cache_entries: usize,
    pub echoes: usize,
}

impl From<ClearResult> for ClearResponse {
    fn from(result: ClearResult) -> Self {
        Self {
            message: "All caches cleared successfully".to_string(),
            cache_entries: result.cache_entries,
            echoes: result.echoes,
        }
    }
}

/// One registered rule as shown by the API
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub pattern: String,
    pub ttl_seconds: u64,
    pub dedupe: bool,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub enabled: bool,
    /// True if the rule derives its own cache key
    pub custom_key: bool,
}

impl From<&OptimizationRule> for RuleSummary {
    fn from(rule: &OptimizationRule) -> Self {
        Self {
            pattern: rule.pattern.clone(),
            ttl_seconds: rule.ttl_seconds,
            dedupe: rule.dedupe_enabled,
            tags: rule.tags.clone(),
            priority: rule.priority,
            enabled: rule.enabled,
            custom_key: rule.key_generator.is_some(),
        }
    }
}

/// Response body for GET /rules
#[derive(Debug, Clone, Serialize)]
pub struct RulesResponse {
    pub total: usize,
    pub rules: Vec<RuleSummary>,
}

impl RulesResponse {
    pub fn new(rules: Vec<RuleSummary>) -> Self {
        Self {
            total: rules.len(),
            rules,
        }
    }
}

/// Response body for POST /rules
#[derive(Debug, Clone, Serialize)]
pub struct AddRuleResponse {
    pub message: String,
    pub replaced: bool,
    pub rule: RuleSummary,
}

impl AddRuleResponse {
    pub fn new(rule: RuleSummary, replaced: bool) -> Self {
        let verb = if replaced { "replaced" } else { "added" };
        Self {
            message: format!("Rule '{}' {}", rule.pattern, verb),
            replaced,
            rule,
        }
    }
}

/// Response body for POST /test/performance
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTestResponse {
    pub message: String,
    pub rule: RuleSummary,
    pub report: LoadTestReport,
    pub metrics: MetricsSnapshot,
}

/// Response body for unknown routes
#[derive(Debug, Clone, Serialize)]
pub struct NotFoundResponse {
    pub error: String,
    pub available_endpoints: Vec<String>,
}

impl NotFoundResponse {
    pub fn new(endpoints: &[&str]) -> Self {
        Self {
            error: "Endpoint not found".to_string(),
            available_endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
