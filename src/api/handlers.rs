//! API Handlers
//!
//! HTTP request handlers for each admin endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::models::{
    AddRuleRequest, AddRuleResponse, ClearResponse, HealthResponse, InvalidateRequest,
    InvalidateResponse, MetricsResponse, NotFoundResponse, PerformanceTestRequest,
    PerformanceTestResponse, RuleSummary, RulesResponse,
};
use crate::optimizer::{run_load_test, Optimizer};
use crate::rules::OptimizationRule;

/// Endpoints listed by the 404 fallback.
pub const ENDPOINTS: [&str; 7] = [
    "GET /health",
    "GET /metrics",
    "POST /cache/invalidate",
    "POST /cache/clear",
    "GET /rules",
    "POST /rules",
    "POST /test/performance",
];

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Shared optimizer over JSON payloads
    pub optimizer: Arc<Optimizer<Value>>,
}

impl AppState {
    /// Creates a new AppState around an existing optimizer.
    pub fn new(optimizer: Optimizer<Value>) -> Self {
        Self {
            optimizer: Arc::new(optimizer),
        }
    }

    /// Creates a new AppState from configuration.
    ///
    /// Fails if a configured rules file cannot be loaded.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(Optimizer::from_config(config)?))
    }
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.optimizer.metrics().await))
}

/// Handler for GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse::new(state.optimizer.metrics().await))
}

/// Handler for POST /cache/invalidate
///
/// Purges every cached response carrying one of the given tags.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let result = state.optimizer.invalidate(&req.tags).await;
    Ok(Json(result.into()))
}

/// Handler for POST /cache/clear
pub async fn clear_handler(State(state): State<AppState>) -> Json<ClearResponse> {
    Json(state.optimizer.clear_all().await.into())
}

/// Handler for GET /rules
pub async fn list_rules_handler(State(state): State<AppState>) -> Json<RulesResponse> {
    let rules = state
        .optimizer
        .rules()
        .iter()
        .map(|rule| RuleSummary::from(rule.as_ref()))
        .collect();
    Json(RulesResponse::new(rules))
}

/// Handler for POST /rules
///
/// Registers a rule, replacing any rule with the same pattern.
pub async fn add_rule_handler(
    State(state): State<AppState>,
    Json(req): Json<AddRuleRequest>,
) -> Result<Json<AddRuleResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let rule = req.rule.into_rule();
    let summary = RuleSummary::from(&rule);
    let replaced = state.optimizer.add_rule(rule);

    Ok(Json(AddRuleResponse::new(summary, replaced)))
}

/// Handler for POST /test/performance
///
/// Registers a rule for the test endpoint and fires concurrent calls at it.
pub async fn performance_test_handler(
    State(state): State<AppState>,
    Json(req): Json<PerformanceTestRequest>,
) -> Result<Json<PerformanceTestResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let rule = OptimizationRule::new(req.endpoint.clone(), req.ttl_seconds)
        .with_dedupe(req.dedupe)
        .with_tags(["performance-test"]);
    let summary = RuleSummary::from(&rule);
    state.optimizer.add_rule(rule);

    let report = run_load_test(
        state.optimizer.clone(),
        &req.endpoint,
        req.concurrent_requests,
        Duration::from_millis(req.work_ms),
    )
    .await;

    Ok(Json(PerformanceTestResponse {
        message: "Performance test completed".to_string(),
        rule: summary,
        report,
        metrics: state.optimizer.metrics().await,
    }))
}

/// Fallback for unknown routes
pub async fn not_found_handler() -> (StatusCode, Json<NotFoundResponse>) {
    (StatusCode::NOT_FOUND, Json(NotFoundResponse::new(&ENDPOINTS)))
}
