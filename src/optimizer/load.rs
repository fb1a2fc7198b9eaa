//! Synthetic load runner behind the performance test endpoint.
//!
//! Fires N concurrent optimized calls at one endpoint against an operation
//! that just sleeps, then reports how many times the operation actually ran.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::info;

use super::Optimizer;
use crate::request::RequestDescriptor;

#[derive(Debug, Clone, Serialize)]
pub struct LoadTestReport {
    pub endpoint: String,
    pub concurrent_requests: usize,
    pub successful: usize,
    pub failed: usize,
    /// Times the synthetic operation actually ran
    pub operations_executed: usize,
    pub cache_hits: usize,
    pub deduplicated: usize,
    pub total_time_ms: f64,
    pub average_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
}

/// Runs `concurrent_requests` simultaneous GETs of `endpoint`, each backed by
/// an operation taking `work`.
pub async fn run_load_test(
    optimizer: Arc<Optimizer<Value>>,
    endpoint: &str,
    concurrent_requests: usize,
    work: Duration,
) -> LoadTestReport {
    let executions = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..concurrent_requests)
        .map(|_| {
            let optimizer = optimizer.clone();
            let executions = executions.clone();
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                let request = RequestDescriptor::get(endpoint.clone());
                let call_started = Instant::now();
                let result = optimizer
                    .optimize_detailed(&request, move || async move {
                        let execution = executions.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(work).await;
                        Ok(json!({
                            "endpoint": endpoint,
                            "execution": execution,
                            "generated_at": Utc::now().to_rfc3339(),
                        }))
                    })
                    .await;
                (result, call_started.elapsed())
            })
        })
        .collect();

    let mut report = LoadTestReport {
        endpoint: endpoint.to_string(),
        concurrent_requests,
        successful: 0,
        failed: 0,
        operations_executed: 0,
        cache_hits: 0,
        deduplicated: 0,
        total_time_ms: 0.0,
        average_response_time_ms: 0.0,
        min_response_time_ms: 0.0,
        max_response_time_ms: 0.0,
    };
    let mut latencies = Vec::with_capacity(concurrent_requests);

    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((Ok(optimized), elapsed)) => {
                report.successful += 1;
                if optimized.cache_hit {
                    report.cache_hits += 1;
                }
                if optimized.deduplicated {
                    report.deduplicated += 1;
                }
                latencies.push(elapsed.as_secs_f64() * 1000.0);
            }
            Ok((Err(_), elapsed)) => {
                report.failed += 1;
                latencies.push(elapsed.as_secs_f64() * 1000.0);
            }
            Err(_) => report.failed += 1,
        }
    }

    report.total_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    report.operations_executed = executions.load(Ordering::SeqCst);
    if !latencies.is_empty() {
        report.average_response_time_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
        report.min_response_time_ms = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        report.max_response_time_ms = latencies.iter().copied().fold(0.0, f64::max);
    }

    info!(
        endpoint = %report.endpoint,
        requests = concurrent_requests,
        executed = report.operations_executed,
        total_ms = report.total_time_ms,
        "Load test finished"
    );
    report
}
