//! Event Logging Task
//!
//! Subscribes to the optimizer's event bus and writes every event to the log.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventEnvelope, OptimizerEvent};

/// Spawns a task logging events from `events` until the bus closes.
///
/// Problems (slow requests, failures) are logged at warn, bulk cache
/// operations at info, everything else at debug.
pub fn spawn_event_logger(mut events: broadcast::Receiver<EventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => log_event(&envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind; events dropped");
                }
                Err(RecvError::Closed) => {
                    debug!("Event bus closed; event logger stopping");
                    break;
                }
            }
        }
    })
}

fn log_event(envelope: &EventEnvelope) {
    let at = envelope.at.to_rfc3339();
    match &envelope.event {
        OptimizerEvent::SlowRequest { path, elapsed_ms } => {
            warn!(%at, path = %path, elapsed_ms, "Slow request detected");
        }
        OptimizerEvent::OptimizationError { path, rule, error } => {
            warn!(%at, path = %path, rule = %rule, error = %error, "Optimization error");
        }
        OptimizerEvent::CacheInvalidated {
            tags,
            total_invalidated,
        } => {
            info!(%at, tags = ?tags, total_invalidated, "Cache invalidated");
        }
        OptimizerEvent::CachesCleared => info!(%at, "Caches cleared"),
        other => debug!(%at, event = other.event_type(), details = ?other, "Optimizer event"),
    }
}
