//! Optimizer Module
//!
//! The single entry point in front of a business operation.
//!
//! For each request the optimizer resolves the governing rule, answers from
//! the response cache when it can, and otherwise runs the operation, through
//! the deduplicator when the rule asks for it. Successful results are cached
//! under the rule's TTL and tags. Cache trouble never fails a request: the
//! cache is bypassed and the operation still runs.

mod load;
mod stats;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{KvBackend, MemoryBackend};
use crate::cache::{CacheStats, CacheStore, Clock, Priority, SystemClock, DEFAULT_KEY_PREFIX};
use crate::config::Config;
use crate::dedup::{DedupConfig, DedupStats, RequestDeduplicator, Settled};
use crate::error::OptimizeError;
use crate::events::{EventBus, EventEnvelope, OptimizerEvent};
use crate::request::RequestDescriptor;
use crate::rules::{builtin_rules, load_rules_file, OptimizationRule, RuleEngine};

pub use load::{run_load_test, LoadTestReport};
pub use stats::PerformanceStats;

/// Default slow-request threshold.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(1000);

/// Values the optimizer can cache and share between callers.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// == Results ==
/// A successful optimized call and how it was served.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized<T> {
    pub value: T,
    /// Answered from the response cache
    pub cache_hit: bool,
    /// Answered by another caller's execution
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationResult {
    pub tags: Vec<String>,
    pub total_invalidated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearResult {
    pub cache_entries: usize,
    pub echoes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache_entries: usize,
    pub backend_values: usize,
    pub echoes: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.cache_entries + self.backend_values + self.echoes
    }
}

/// Point-in-time view of every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub deduplicated_requests: u64,
    pub deduplication_rate: f64,
    pub concurrent_requests: usize,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub rules: usize,
    pub cache: CacheStats,
    pub deduplication: DedupStats,
    pub performance: PerformanceStats,
}

/// Cache write performed once a fresh result is available.
struct CacheWrite {
    cache: Arc<CacheStore>,
    key: String,
    ttl_seconds: u64,
    tags: std::collections::BTreeSet<String>,
    priority: Priority,
}

impl CacheWrite {
    /// Returns false if the result could not be cached.
    async fn store<T: Serialize>(self, value: &T) -> bool {
        match self
            .cache
            .set_value(&self.key, value, self.ttl_seconds, self.tags, self.priority)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Cache write failed; result returned uncached");
                false
            }
        }
    }
}

fn rule_name(rule: &OptimizationRule) -> String {
    if rule.pattern.is_empty() {
        "default".to_string()
    } else {
        rule.pattern.clone()
    }
}

// == Optimizer ==
pub struct Optimizer<T> {
    rules: RuleEngine,
    cache: Arc<CacheStore>,
    backend: Arc<dyn KvBackend>,
    dedup: RequestDeduplicator<T>,
    events: EventBus,
    performance: Mutex<PerformanceStats>,
    slow_threshold: Duration,
}

impl<T> fmt::Debug for Optimizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Optimizer")
            .field("rules", &self.rules)
            .field("cache", &self.cache)
            .field("dedup", &self.dedup)
            .field("slow_threshold", &self.slow_threshold)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Optimizer<T> {
    pub fn builder() -> OptimizerBuilder {
        OptimizerBuilder::default()
    }

    /// Builds an optimizer from `config`, with the rules file if one is set
    /// and the built-in rules otherwise.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let rules = match &config.rules_file {
            Some(path) => load_rules_file(path)?,
            None => builtin_rules(),
        };

        Ok(Self::builder()
            .default_ttl(config.default_ttl)
            .rules(rules)
            .key_prefix(config.cache_key_prefix.clone())
            .dedup_config(config.dedup_config())
            .slow_threshold(config.slow_threshold())
            .event_capacity(config.event_channel_capacity)
            .build())
    }

    // == Optimize ==
    /// Serves `request`, running `operation` only when neither the cache nor
    /// an in-flight execution can answer it.
    pub async fn optimize<F, Fut>(&self, request: &RequestDescriptor, operation: F) -> Result<T, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.optimize_detailed(request, operation)
            .await
            .map(|optimized| optimized.value)
    }

    /// Like [`Optimizer::optimize`], also reporting how the result was served.
    pub async fn optimize_detailed<F, Fut>(
        &self,
        request: &RequestDescriptor,
        operation: F,
    ) -> Result<Optimized<T>, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let rule = self.rules.resolve(&request.path);
        let key = rule.cache_key(request);

        let outcome = self.execute(&request.path, &rule, &key, operation).await;
        self.record(&request.path, &rule, started.elapsed(), &outcome);
        outcome
    }

    async fn execute<F, Fut>(
        &self,
        path: &str,
        rule: &OptimizationRule,
        key: &str,
        operation: F,
    ) -> Result<Optimized<T>, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if rule.caches() {
            match self.cache.get::<T>(key).await {
                Ok(Some(value)) => {
                    debug!(path = %path, key = %key, "Cache hit");
                    self.events.publish(OptimizerEvent::CacheHit {
                        path: path.to_string(),
                        key: key.to_string(),
                        rule: rule_name(rule),
                    });
                    return Ok(Optimized {
                        value,
                        cache_hit: true,
                        deduplicated: false,
                    });
                }
                Ok(None) => self.events.publish(OptimizerEvent::CacheMiss {
                    path: path.to_string(),
                    key: key.to_string(),
                }),
                Err(e) => {
                    warn!(path = %path, key = %key, error = %e, "Cache read failed; bypassing cache")
                }
            }
        }

        let write = rule.caches().then(|| CacheWrite {
            cache: self.cache.clone(),
            key: key.to_string(),
            ttl_seconds: rule.ttl_seconds,
            tags: rule.tag_set(),
            priority: rule.priority,
        });
        let run = move || async move {
            let value = operation().await?;
            let cached = match write {
                Some(write) => write.store(&value).await,
                None => true,
            };
            // An uncached result is invisible to tag invalidation, so it is
            // not replayed either.
            Ok::<Settled<T>, anyhow::Error>(if cached {
                Settled::replayable(value)
            } else {
                Settled::once(value)
            })
        };

        if rule.dedupe_enabled {
            // Replays never outlive what the rule lets the cache keep.
            let echo_window = Duration::from_secs(rule.ttl_seconds);
            let coalesced = self
                .dedup
                .execute_or_join_settled(key, echo_window, run)
                .await?;
            let deduplicated = coalesced.role.is_deduplicated();
            if deduplicated {
                self.events.publish(OptimizerEvent::DedupJoin {
                    path: path.to_string(),
                    key: key.to_string(),
                });
            }
            Ok(Optimized {
                value: coalesced.value,
                cache_hit: false,
                deduplicated,
            })
        } else {
            let settled = run().await.map_err(OptimizeError::operation)?;
            Ok(Optimized {
                value: settled.value,
                cache_hit: false,
                deduplicated: false,
            })
        }
    }

    /// Updates performance counters and publishes the outcome.
    fn record(
        &self,
        path: &str,
        rule: &OptimizationRule,
        elapsed: Duration,
        outcome: &Result<Optimized<T>, OptimizeError>,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let slow = elapsed > self.slow_threshold;

        {
            let mut perf = self
                .performance
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            perf.record_request(elapsed.as_secs_f64() * 1000.0);
            if slow {
                perf.slow_requests += 1;
            }
            match outcome {
                Ok(optimized) => {
                    if optimized.cache_hit {
                        perf.cache_hits += 1;
                    }
                    if optimized.deduplicated {
                        perf.deduplicated_requests += 1;
                    }
                }
                Err(_) => perf.errors += 1,
            }
        }

        if slow {
            warn!(path = %path, elapsed_ms, "Slow request");
            self.events.publish(OptimizerEvent::SlowRequest {
                path: path.to_string(),
                elapsed_ms,
            });
        }

        match outcome {
            Ok(optimized) if optimized.cache_hit => {}
            Ok(optimized) => {
                debug!(path = %path, rule = %rule_name(rule), elapsed_ms, deduplicated = optimized.deduplicated, "Request optimized");
                self.events.publish(OptimizerEvent::RequestOptimized {
                    path: path.to_string(),
                    rule: rule_name(rule),
                    elapsed_ms,
                    deduplicated: optimized.deduplicated,
                });
            }
            Err(e) => {
                warn!(path = %path, rule = %rule_name(rule), error = %e, "Optimized request failed");
                self.events.publish(OptimizerEvent::OptimizationError {
                    path: path.to_string(),
                    rule: rule_name(rule),
                    error: e.to_string(),
                });
            }
        }
    }

    // == Invalidation ==
    /// Purges every cached response carrying any of `tags`.
    ///
    /// Replayable results for the purged keys are dropped too, so the next
    /// call executes again. A backend failure for one tag is logged and the
    /// remaining tags are still processed.
    pub async fn invalidate(&self, tags: &[String]) -> InvalidationResult {
        let mut total_invalidated = 0;

        for tag in tags {
            let purge = self.cache.invalidate_tag_keys(tag).await;
            total_invalidated += purge.removed.len();
            self.dedup.forget(&purge.removed);
            if let Some(e) = purge.error {
                warn!(tag = %tag, error = %e, removed = purge.removed.len(), "Tag invalidation incomplete");
            }
        }

        info!(tags = ?tags, total_invalidated, "Cache invalidated");
        self.events.publish(OptimizerEvent::CacheInvalidated {
            tags: tags.to_vec(),
            total_invalidated,
        });

        InvalidationResult {
            tags: tags.to_vec(),
            total_invalidated,
        }
    }

    /// Drops every cached response and every replayable result.
    pub async fn clear_all(&self) -> ClearResult {
        let cache_entries = match self.cache.clear().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to clear cache backend");
                0
            }
        };
        let echoes = self.dedup.clear();

        info!(cache_entries, echoes, "All caches cleared");
        self.events.publish(OptimizerEvent::CachesCleared);

        ClearResult {
            cache_entries,
            echoes,
        }
    }

    // == Rules ==
    /// Registers or replaces a rule. Returns true if one was replaced.
    pub fn add_rule(&self, rule: OptimizationRule) -> bool {
        let pattern = rule.pattern.clone();
        let replaced = self.rules.add_rule(rule);

        info!(pattern = %pattern, replaced, "Optimization rule registered");
        self.events.publish(OptimizerEvent::RuleAdded { pattern, replaced });
        replaced
    }

    /// Adds `tags` to every registered rule.
    pub fn add_global_tags(&self, tags: &[String]) {
        self.rules.add_global_tags(tags);
    }

    pub fn rules(&self) -> Vec<Arc<OptimizationRule>> {
        self.rules.rules()
    }

    /// Rule that would govern `path`.
    pub fn resolve(&self, path: &str) -> Arc<OptimizationRule> {
        self.rules.resolve(path)
    }

    // == Maintenance ==
    /// Reclaims memory held by expired entries, values and echoes.
    pub async fn sweep(&self) -> SweepReport {
        let cache_entries = self.cache.cleanup_expired().await;
        let backend_values = match self.backend.sweep_expired().await {
            Ok(count) => count,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Backend sweep failed");
                0
            }
        };
        let echoes = self.dedup.purge_expired_echoes();

        SweepReport {
            cache_entries,
            backend_values,
            echoes,
        }
    }

    // == Observability ==
    pub async fn metrics(&self) -> MetricsSnapshot {
        let cache = self.cache.stats().await;
        let deduplication = self.dedup.stats();
        let performance = self
            .performance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        MetricsSnapshot {
            hits: cache.hits,
            misses: cache.misses,
            hit_rate: cache.hit_rate(),
            deduplicated_requests: deduplication.deduplicated_requests,
            deduplication_rate: deduplication.deduplication_rate(),
            concurrent_requests: deduplication.concurrent_requests,
            average_response_time_ms: performance.average_response_time_ms,
            error_rate: performance.error_rate(),
            rules: self.rules.len(),
            cache,
            deduplication,
            performance,
        }
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn dedup(&self) -> &RequestDeduplicator<T> {
        &self.dedup
    }
}

// == Builder ==
pub struct OptimizerBuilder {
    default_ttl: u64,
    rules: Vec<OptimizationRule>,
    backend: Option<Arc<dyn KvBackend>>,
    clock: Option<Arc<dyn Clock>>,
    key_prefix: String,
    dedup: DedupConfig,
    slow_threshold: Duration,
    event_capacity: usize,
}

impl Default for OptimizerBuilder {
    fn default() -> Self {
        Self {
            default_ttl: 300,
            rules: Vec::new(),
            backend: None,
            clock: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dedup: DedupConfig::default(),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            event_capacity: 1024,
        }
    }
}

impl OptimizerBuilder {
    /// TTL of the fallback rule. Zero is raised to one second.
    pub fn default_ttl(mut self, seconds: u64) -> Self {
        self.default_ttl = seconds.max(1);
        self
    }

    pub fn rule(mut self, rule: OptimizationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = OptimizationRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Storage for cached responses. Defaults to a [`MemoryBackend`] on the
    /// builder's clock.
    pub fn backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn dedup_config(mut self, config: DedupConfig) -> Self {
        self.dedup = config;
        self
    }

    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build<T: Payload>(self) -> Optimizer<T> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::with_clock(clock.clone())));
        let cache = CacheStore::new(backend.clone(), clock, self.key_prefix);

        info!(
            rules = self.rules.len(),
            backend = backend.name(),
            default_ttl = self.default_ttl,
            "Optimizer initialized"
        );

        Optimizer {
            rules: RuleEngine::with_rules(self.default_ttl, self.rules),
            cache: Arc::new(cache),
            backend,
            dedup: RequestDeduplicator::new(self.dedup),
            events: EventBus::new(self.event_capacity),
            performance: Mutex::new(PerformanceStats::new()),
            slow_threshold: self.slow_threshold,
        }
    }
}
