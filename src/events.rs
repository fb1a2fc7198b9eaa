//! Optimizer Events
//!
//! Structured lifecycle notifications published by the optimizer.
//!
//! Events travel over a tokio broadcast channel. Publishing never blocks and
//! never fails the request: with no subscribers the event is dropped, and a
//! slow subscriber lags rather than applying back-pressure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

// == Event Types ==
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OptimizerEvent {
    /// Served from the response cache
    CacheHit { path: String, key: String, rule: String },
    /// Cacheable request found nothing usable
    CacheMiss { path: String, key: String },
    /// Joined an in-flight execution or reused a just-settled result
    DedupJoin { path: String, key: String },
    /// Request finished successfully without a cache hit
    RequestOptimized {
        path: String,
        rule: String,
        elapsed_ms: u64,
        deduplicated: bool,
    },
    /// Request took longer than the slow threshold
    SlowRequest { path: String, elapsed_ms: u64 },
    /// The operation (or its deduplicated execution) failed
    OptimizationError { path: String, rule: String, error: String },
    /// Entries were purged by tag
    CacheInvalidated { tags: Vec<String>, total_invalidated: usize },
    /// Every cache and echo was dropped
    CachesCleared,
    /// A rule was registered or replaced at runtime
    RuleAdded { pattern: String, replaced: bool },
}

impl OptimizerEvent {
    /// Short event name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            OptimizerEvent::CacheHit { .. } => "cacheHit",
            OptimizerEvent::CacheMiss { .. } => "cacheMiss",
            OptimizerEvent::DedupJoin { .. } => "dedupJoin",
            OptimizerEvent::RequestOptimized { .. } => "requestOptimized",
            OptimizerEvent::SlowRequest { .. } => "slowRequest",
            OptimizerEvent::OptimizationError { .. } => "optimizationError",
            OptimizerEvent::CacheInvalidated { .. } => "cacheInvalidated",
            OptimizerEvent::CachesCleared => "cachesCleared",
            OptimizerEvent::RuleAdded { .. } => "ruleAdded",
        }
    }
}

/// An event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OptimizerEvent,
}

// == Event Bus ==
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: OptimizerEvent) {
        let event_type = event.event_type();
        let envelope = EventEnvelope {
            at: Utc::now(),
            event,
        };
        match self.tx.send(envelope) {
            Ok(receivers) => trace!(event_type, receivers, "Published event"),
            Err(_) => trace!(event_type, "No subscribers for event"),
        }
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(OptimizerEvent::CachesCleared);
        bus.publish(OptimizerEvent::SlowRequest {
            path: "/a".into(),
            elapsed_ms: 1500,
        });

        assert_eq!(rx.recv().await.unwrap().event, OptimizerEvent::CachesCleared);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event.event_type(), "slowRequest");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(OptimizerEvent::CachesCleared);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let envelope = EventEnvelope {
            at: Utc::now(),
            event: OptimizerEvent::CacheInvalidated {
                tags: vec!["t".into()],
                total_invalidated: 3,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "cacheInvalidated");
        assert_eq!(json["total_invalidated"], 3);
        assert!(json.get("at").is_some());
    }
}
