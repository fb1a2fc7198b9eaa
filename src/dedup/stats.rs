//! Deduplication statistics.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    /// Calls to `execute_or_join`
    pub total_requests: u64,
    /// Calls answered by another caller's execution (joined or echoed)
    pub deduplicated_requests: u64,
    /// In-flight executions right now
    pub concurrent_requests: usize,
    /// Average time joiners spent waiting, in milliseconds
    pub average_wait_time_ms: f64,
    /// Executions that hit the lifetime ceiling
    pub timeouts: u64,
    /// Executions that ended with an operation error
    pub failures: u64,
    /// Executions aborted because every caller went away
    pub cancelled: u64,
    /// Settled results currently replayable
    pub echo_entries: usize,
    #[serde(skip)]
    waits: u64,
}

impl DedupStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// deduplicated / total, or 0.0 before the first request.
    pub fn deduplication_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.deduplicated_requests as f64 / self.total_requests as f64
        }
    }

    pub fn record_wait(&mut self, wait_ms: f64) {
        self.waits += 1;
        self.average_wait_time_ms += (wait_ms - self.average_wait_time_ms) / self.waits as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deduplication_rate() {
        let mut stats = DedupStats::new();
        assert_eq!(stats.deduplication_rate(), 0.0);

        stats.total_requests = 4;
        stats.deduplicated_requests = 3;
        assert_eq!(stats.deduplication_rate(), 0.75);
    }

    #[test]
    fn test_average_wait() {
        let mut stats = DedupStats::new();
        stats.record_wait(10.0);
        stats.record_wait(30.0);
        assert!((stats.average_wait_time_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_wait_counter_is_not_serialized() {
        let json = serde_json::to_value(DedupStats::new()).unwrap();
        assert!(json.get("waits").is_none());
        assert!(json.get("deduplicated_requests").is_some());
    }
}
