//! In-process key-value backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use tokio::sync::RwLock;
use tracing::debug;

use super::KvBackend;
use crate::cache::{Clock, SystemClock};
use crate::error::CacheError;

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: u64,
}

#[derive(Debug)]
struct StoredSet {
    members: BTreeSet<String>,
    expires_at: u64,
}

/// HashMap-backed store with lazy TTL expiry.
#[derive(Debug)]
pub struct MemoryBackend {
    values: RwLock<HashMap<String, StoredValue>>,
    sets: RwLock<HashMap<String, StoredSet>>,
    clock: Arc<dyn Clock>,
}

fn expiry_after(now_ms: u64, ttl_seconds: u64) -> u64 {
    now_ms.saturating_add(ttl_seconds.saturating_mul(1000).max(1))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Drops every expired value and set. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = {
            let mut values = self.values.write().await;
            let before = values.len();
            values.retain(|_, v| now < v.expires_at);
            before - values.len()
        };
        {
            let mut sets = self.sets.write().await;
            let before = sets.len();
            sets.retain(|_, set| now < set.expires_at);
            removed += before - sets.len();
        }
        if removed > 0 {
            debug!(removed, "Purged expired backend values");
        }
        removed
    }

    /// Number of stored values, sets excluded.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    /// Number of stored sets.
    pub async fn set_count(&self) -> usize {
        self.sets.read().await.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now_ms();
        {
            let values = self.values.read().await;
            match values.get(key) {
                Some(v) if now < v.expires_at => return Ok(Some(v.bytes.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it unless it was rewritten in the meantime.
        let mut values = self.values.write().await;
        if values.get(key).is_some_and(|v| now >= v.expires_at) {
            values.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), CacheError> {
        let expires_at = expiry_after(self.clock.now_ms(), ttl_seconds);
        self.values.write().await.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let value = self.values.write().await.remove(key).is_some();
        let set = self.sets.write().await.remove(key).is_some();
        Ok(value || set)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        let now = self.clock.now_ms();
        let expires_at = expiry_after(now, ttl_seconds);
        let mut sets = self.sets.write().await;
        let set = sets.entry(key.to_string()).or_insert_with(|| StoredSet {
            members: BTreeSet::new(),
            expires_at,
        });
        if now >= set.expires_at {
            set.members.clear();
        }
        set.expires_at = set.expires_at.max(expires_at);
        set.members.insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let now = self.clock.now_ms();
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .filter(|set| now < set.expires_at)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut sets = self.sets.write().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.members.remove(member);
        if set.members.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| CacheError::BackendUnavailable(format!("invalid key pattern '{}': {}", pattern, e)))?;
        let now = self.clock.now_ms();
        let mut keys: Vec<String> = self
            .values
            .read()
            .await
            .iter()
            .filter(|(key, v)| now < v.expires_at && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            self.sets
                .read()
                .await
                .iter()
                .filter(|(key, set)| now < set.expires_at && pattern.matches(key))
                .map(|(key, _)| key.clone()),
        );
        Ok(keys)
    }

    async fn sweep_expired(&self) -> Result<usize, CacheError> {
        Ok(self.purge_expired().await)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use std::time::Duration;

    fn backend() -> (Arc<ManualClock>, MemoryBackend) {
        let clock = Arc::new(ManualClock::starting_at(0));
        let backend = MemoryBackend::with_clock(clock.clone());
        (clock, backend)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_, backend) = backend();

        backend.set_with_ttl("k", b"v".to_vec(), 60).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_values_expire_lazily() {
        let (clock, backend) = backend();

        backend.set_with_ttl("k", b"v".to_vec(), 1).await.unwrap();
        clock.advance(Duration::from_millis(999));
        assert!(backend.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_millis(1));
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_matching_glob() {
        let (_, backend) = backend();
        backend.set_with_ttl("cache:a", vec![], 60).await.unwrap();
        backend.set_with_ttl("cache:b", vec![], 60).await.unwrap();
        backend.set_with_ttl("other:c", vec![], 60).await.unwrap();

        let mut keys = backend.keys_matching("cache:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a", "cache:b"]);
    }

    #[tokio::test]
    async fn test_sets_track_members_until_ttl() {
        let (clock, backend) = backend();

        backend.add_to_set("tag:a", "k1", 10).await.unwrap();
        backend.add_to_set("tag:a", "k2", 60).await.unwrap();
        backend.add_to_set("tag:a", "k1", 5).await.unwrap();

        let mut members = backend.set_members("tag:a").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1", "k2"]);
        assert!(backend.set_members("tag:none").await.unwrap().is_empty());

        // The set lives as long as its longest-lived member.
        clock.advance(Duration::from_secs(30));
        assert_eq!(backend.set_members("tag:a").await.unwrap().len(), 2);

        assert!(backend.remove_from_set("tag:a", "k1").await.unwrap());
        assert!(!backend.remove_from_set("tag:a", "k1").await.unwrap());
        assert_eq!(backend.set_members("tag:a").await.unwrap(), vec!["k2"]);

        assert!(backend.remove_from_set("tag:a", "k2").await.unwrap());
        assert_eq!(backend.set_count().await, 0);

        backend.add_to_set("tag:b", "k", 1).await.unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(backend.set_members("tag:b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_listing_cover_sets() {
        let (_, backend) = backend();
        backend.set_with_ttl("cache:a", vec![], 60).await.unwrap();
        backend.add_to_set("tag:cache:t", "a", 60).await.unwrap();

        let mut keys = backend.keys_matching("*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a", "tag:cache:t"]);

        assert!(backend.delete("tag:cache:t").await.unwrap());
        assert!(backend.set_members("tag:cache:t").await.unwrap().is_empty());
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, backend) = backend();
        backend.set_with_ttl("short", vec![], 1).await.unwrap();
        backend.set_with_ttl("long", vec![], 100).await.unwrap();
        backend.add_to_set("tag:short", "short", 1).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(backend.purge_expired().await, 2);
        assert_eq!(backend.set_count().await, 0);
        assert_eq!(backend.len().await, 1);

        clock.advance(Duration::from_secs(100));
        assert_eq!(backend.sweep_expired().await.unwrap(), 1);
        assert!(backend.is_empty().await);
    }
}
