//! Request Optimizer - response caching and request coalescing
//!
//! Puts a rule-driven response cache with tag-based invalidation and an
//! in-flight request deduplicator in front of arbitrary async operations.

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod models;
pub mod optimizer;
pub mod request;
pub mod rules;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use error::{CacheError, OptimizeError};
pub use optimizer::{Optimizer, OptimizerBuilder};
pub use request::RequestDescriptor;
pub use rules::OptimizationRule;
pub use tasks::{spawn_cleanup_task, spawn_event_logger};
