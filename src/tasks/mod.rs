//! Background Tasks Module
//!
//! Contains background tasks that run alongside the admin server.
//!
//! # Tasks
//! - Cleanup: reclaims expired cache entries and echoes at configured intervals
//! - Event logging: writes optimizer events to the log

mod cleanup;
mod events;

pub use cleanup::spawn_cleanup_task;
pub use events::spawn_event_logger;
