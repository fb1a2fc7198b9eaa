//! Request and Response models for the optimizer admin API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{AddRuleRequest, InvalidateRequest, PerformanceTestRequest};
pub use responses::{
    AddRuleResponse, ClearResponse, ErrorResponse, HealthResponse, InvalidateResponse,
    MetricsResponse, NotFoundResponse, PerformanceTestResponse, RuleSummary, RulesResponse,
};
