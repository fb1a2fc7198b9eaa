//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, writes and
//! tag-driven evictions.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of reads answered from the cache
    pub hits: u64,
    /// Number of reads that found nothing usable
    pub misses: u64,
    /// Number of entries written
    pub sets: u64,
    /// Number of entries removed explicitly or by lazy expiry
    pub deletes: u64,
    /// Number of entries removed by tag invalidation
    pub evictions: u64,
    /// Number of reads (hits + misses)
    pub total_requests: u64,
    /// Running average read latency in milliseconds
    pub average_response_time_ms: f64,
    /// Keys currently tracked by the tag index
    pub tracked_keys: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Record Read ==
    /// Counts one read and folds its latency into the running average.
    pub fn record_read(&mut self, hit: bool, elapsed_ms: f64) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.average_response_time_ms += (elapsed_ms - self.average_response_time_ms) / n;
    }

    pub fn record_set(&mut self) {
        self.sets += 1;
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
    }

    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }

    pub fn set_tracked_keys(&mut self, count: usize) {
        self.tracked_keys = count;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.tracked_keys, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::new().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_read(true, 1.0);
        stats.record_read(false, 1.0);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.total_requests, 2);
    }

    #[test]
    fn test_running_average() {
        let mut stats = CacheStats::new();
        stats.record_read(true, 2.0);
        stats.record_read(true, 4.0);
        stats.record_read(false, 6.0);
        assert!((stats.average_response_time_ms - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_evictions() {
        let mut stats = CacheStats::new();
        stats.record_evictions(3);
        stats.record_evictions(2);
        assert_eq!(stats.evictions, 5);
    }
}
