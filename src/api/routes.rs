//! API Routes
//!
//! Configures the Axum router with all admin endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    add_rule_handler, clear_handler, health_handler, invalidate_handler, list_rules_handler,
    metrics_handler, not_found_handler, performance_test_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check with a metrics snapshot
/// - `GET /metrics` - Cache, deduplication and performance metrics
/// - `POST /cache/invalidate` - Purge entries by tag
/// - `POST /cache/clear` - Drop every cached response
/// - `GET /rules` / `POST /rules` - List or register optimization rules
/// - `POST /test/performance` - Run a concurrent load test
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .route("/cache/clear", post(clear_handler))
        .route("/rules", get(list_rules_handler).post(add_rule_handler))
        .route("/test/performance", post(performance_test_handler))
        .fallback(not_found_handler)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
