//! Cleanup Task
//!
//! Background task that periodically reclaims expired cache entries, backend
//! values and replayable results.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::optimizer::{Optimizer, Payload};

/// Spawns a background task that periodically sweeps expired state.
///
/// Reads never depend on this task; lazy expiry already hides stale entries.
/// The sweep only keeps memory bounded between reads.
///
/// # Arguments
/// * `optimizer` - Shared optimizer whose caches are swept
/// * `cleanup_interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cleanup_handle = spawn_cleanup_task(optimizer.clone(), 60);
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task<T: Payload>(
    optimizer: Arc<Optimizer<T>>,
    cleanup_interval_secs: u64,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting cleanup task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let report = optimizer.sweep().await;
            if report.total() > 0 {
                info!(
                    cache_entries = report.cache_entries,
                    backend_values = report.backend_values,
                    echoes = report.echoes,
                    "Cleanup: reclaimed expired state"
                );
            } else {
                debug!("Cleanup: nothing expired");
            }

            if let Some(age) = optimizer.dedup().oldest_in_flight() {
                debug!(age_ms = age.as_millis() as u64, "Oldest in-flight execution");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::optimizer::OptimizerBuilder;
    use crate::request::RequestDescriptor;
    use crate::rules::OptimizationRule;
    use serde_json::{json, Value};

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_removes_expired_entries() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let optimizer: Arc<Optimizer<Value>> = Arc::new(
            OptimizerBuilder::default()
                .rule(OptimizationRule::new("/a", 1).with_dedupe(false))
                .clock(clock.clone())
                .build(),
        );
        optimizer
            .optimize(&RequestDescriptor::get("/a"), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(optimizer.cache().len().await, 1);

        clock.advance(Duration::from_secs(2));
        let handle = spawn_cleanup_task(optimizer.clone(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(optimizer.cache().is_empty().await, "Expired entry should have been swept");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_preserves_valid_entries() {
        let optimizer: Arc<Optimizer<Value>> = Arc::new(
            OptimizerBuilder::default()
                .rule(OptimizationRule::new("/a", 3600).with_dedupe(false))
                .build(),
        );
        optimizer
            .optimize(&RequestDescriptor::get("/a"), || async { Ok(json!(1)) })
            .await
            .unwrap();

        let handle = spawn_cleanup_task(optimizer.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(optimizer.cache().len().await, 1, "Valid entry should not be removed");
        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_can_be_aborted() {
        let optimizer: Arc<Optimizer<Value>> = Arc::new(OptimizerBuilder::default().build());

        let handle = spawn_cleanup_task(optimizer, 1);
        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
