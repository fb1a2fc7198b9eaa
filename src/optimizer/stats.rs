//! End-to-end request statistics.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub deduplicated_requests: u64,
    pub slow_requests: u64,
    pub errors: u64,
    /// Running average over every request, in milliseconds
    pub average_response_time_ms: f64,
}

impl PerformanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one finished request and folds its latency into the average.
    pub fn record_request(&mut self, elapsed_ms: f64) {
        self.total_requests += 1;
        self.average_response_time_ms +=
            (elapsed_ms - self.average_response_time_ms) / self.total_requests as f64;
    }

    /// errors / total, or 0.0 before the first request.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut stats = PerformanceStats::new();
        stats.record_request(100.0);
        stats.record_request(200.0);
        stats.record_request(300.0);

        assert_eq!(stats.total_requests, 3);
        assert!((stats.average_response_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate() {
        let mut stats = PerformanceStats::new();
        assert_eq!(stats.error_rate(), 0.0);

        stats.record_request(1.0);
        stats.record_request(1.0);
        stats.errors = 1;
        assert_eq!(stats.error_rate(), 0.5);
    }
}
