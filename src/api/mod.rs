//! API Module
//!
//! HTTP handlers and routing for the optimizer admin API.
//!
//! # Endpoints
//! - `GET /health` - Health check endpoint
//! - `GET /metrics` - Metrics snapshot
//! - `POST /cache/invalidate` - Tag-based invalidation
//! - `POST /cache/clear` - Clear every cache
//! - `GET /rules`, `POST /rules` - Rule listing and registration
//! - `POST /test/performance` - Concurrent load test

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
