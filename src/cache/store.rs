//! Cache Store Module
//!
//! Response cache engine. Envelopes and tag membership sets live in a
//! [`KvBackend`] so that every process sharing it can invalidate what the
//! others wrote. A local tag index mirrors what this process has written or
//! read, for statistics and expiry sweeps.
//!
//! Membership sets are allowed to hold stale members. Invalidation re-reads
//! each candidate's envelope and only deletes entries that still carry the
//! tag.
//!
//! Mutations of a single key (set, delete, lazy expiry, invalidation) are
//! serialized through a fixed set of sharded key locks. The state lock is only
//! ever taken inside a key lock, never the other way round, and is never held
//! across a backend call.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::KvBackend;
use crate::cache::{CacheEntry, CacheStats, Clock, Priority, TagIndex};
use crate::error::CacheError;

/// Number of key-lock shards.
const KEY_LOCK_SHARDS: usize = 64;

#[derive(Debug, Default)]
struct StoreState {
    index: TagIndex,
    stats: CacheStats,
}

// == Tag Purge ==
/// Outcome of invalidating one tag.
///
/// A backend failure on one key does not stop the others, so `removed` is
/// accurate even when `error` is set.
#[derive(Debug, Default)]
pub struct TagPurge {
    /// Keys whose entries were deleted
    pub removed: Vec<String>,
    /// First backend failure met along the way
    pub error: Option<CacheError>,
}

impl TagPurge {
    fn fail(&mut self, err: CacheError) {
        self.error.get_or_insert(err);
    }
}

// == Cache Store ==
/// Tag-aware response cache over a key-value backend.
pub struct CacheStore {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    /// Prefix prepended to every logical key before it reaches the backend
    key_prefix: String,
    state: RwLock<StoreState>,
    key_locks: Vec<Mutex<()>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store writing through `backend` under `key_prefix`.
    pub fn new(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>, key_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            clock,
            key_prefix: key_prefix.into(),
            state: RwLock::new(StoreState::default()),
            key_locks: (0..KEY_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Backend set holding the keys tagged with `tag`.
    fn tag_key(&self, tag: &str) -> String {
        format!("tag:{}{}", self.key_prefix, tag)
    }

    fn key_lock(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.key_locks[(hasher.finish() as usize) % self.key_locks.len()]
    }

    // == Get ==
    /// Reads the entry stored under `key`.
    ///
    /// Expired or undecodable entries read as a miss and are deleted.
    /// A backend failure is counted as a miss and returned to the caller.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let start = Instant::now();
        let lookup = self.lookup(key).await;

        let hit = matches!(lookup, Ok(Some(_)));
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.state.write().await.stats.record_read(hit, elapsed_ms);

        lookup
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now_ms();

        let Some(bytes) = self.backend.get(&self.storage_key(key)).await? else {
            // Gone from the backend; forget any stale record.
            self.forget_if_absent(key).await?;
            return Ok(None);
        };

        let mut entry = match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                self.remove_unconditionally(key).await?;
                return Ok(None);
            }
        };

        if entry.is_expired_at(now) {
            debug!(key = %key, "Cache entry expired");
            self.delete_if_expired(key, now).await?;
            return Ok(None);
        }

        let adopted = {
            let mut state = self.state.write().await;
            state.index.record_access(key, now);
            match state.index.record(key) {
                Some(record) => {
                    entry.access_count = record.access_count;
                    entry.last_accessed_at = record.last_accessed_at;
                    true
                }
                None => false,
            }
        };

        if !adopted {
            // Written by another process sharing the backend.
            let _guard = self.key_lock(key).lock().await;
            let mut state = self.state.write().await;
            if !state.index.contains(key) {
                state.index.register(key, entry.tags.clone(), entry.expires_at, now);
            }
            state.index.record_access(key, now);
        }

        Ok(Some(entry))
    }

    /// Reads and decodes the payload stored under `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get_entry(key).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.payload)?)),
            None => Ok(None),
        }
    }

    // == Set ==
    /// Stores `payload` under `key` for `ttl_seconds`, tagged with `tags`.
    ///
    /// Overwrites replace the previous entry and its tag associations.
    pub async fn set(
        &self,
        key: &str,
        payload: Vec<u8>,
        ttl_seconds: u64,
        tags: BTreeSet<String>,
        priority: Priority,
    ) -> Result<(), CacheError> {
        let _guard = self.key_lock(key).lock().await;

        let now = self.clock.now_ms();
        let entry = CacheEntry::new(key, payload, now, ttl_seconds, tags, priority);
        let bytes = entry.to_bytes()?;
        let ttl = entry.ttl_remaining_secs(now);

        // Every stored envelope is reachable from its tags' sets.
        for tag in &entry.tags {
            self.backend.add_to_set(&self.tag_key(tag), key, ttl).await?;
        }

        self.backend
            .set_with_ttl(&self.storage_key(key), bytes, ttl)
            .await?;

        let mut state = self.state.write().await;
        state.index.register(key, entry.tags, entry.expires_at, now);
        state.stats.record_set();

        debug!(key = %key, ttl = ttl_seconds, priority = %priority, "Cache entry stored");
        Ok(())
    }

    /// Encodes `value` as JSON and stores it.
    pub async fn set_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: u64,
        tags: BTreeSet<String>,
        priority: Priority,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(value)?;
        self.set(key, payload, ttl_seconds, tags, priority).await
    }

    // == Delete ==
    /// Removes `key` and scrubs it from every tag.
    ///
    /// Returns true if an entry existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let _guard = self.key_lock(key).lock().await;
        let existed = self.delete_locked(key).await?;
        if existed {
            self.state.write().await.stats.record_delete();
        }
        Ok(existed)
    }

    /// Deletes with the key lock already held.
    async fn delete_locked(&self, key: &str) -> Result<bool, CacheError> {
        let in_backend = self.backend.delete(&self.storage_key(key)).await?;
        let in_index = self.state.write().await.index.remove(key).is_some();
        Ok(in_backend || in_index)
    }

    async fn remove_unconditionally(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.key_lock(key).lock().await;
        if self.delete_locked(key).await? {
            self.state.write().await.stats.record_delete();
        }
        Ok(())
    }

    /// Deletes `key` unless a concurrent `set` already replaced it.
    async fn delete_if_expired(&self, key: &str, now: u64) -> Result<(), CacheError> {
        let _guard = self.key_lock(key).lock().await;
        let replaced = self
            .state
            .read()
            .await
            .index
            .record(key)
            .is_some_and(|record| record.expires_at > now);
        if !replaced && self.delete_locked(key).await? {
            self.state.write().await.stats.record_delete();
        }
        Ok(())
    }

    async fn forget_if_absent(&self, key: &str) -> Result<(), CacheError> {
        if !self.state.read().await.index.contains(key) {
            return Ok(());
        }
        let _guard = self.key_lock(key).lock().await;
        if self.backend.get(&self.storage_key(key)).await?.is_none() {
            self.state.write().await.index.remove(key);
        }
        Ok(())
    }

    // == Invalidate By Tag ==
    /// Deletes every entry carrying `tag`. Returns the number removed.
    ///
    /// Fails with the first backend error, after every other candidate has
    /// still been processed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let purge = self.invalidate_tag_keys(tag).await;
        match purge.error {
            Some(e) => Err(e),
            None => Ok(purge.removed.len()),
        }
    }

    /// Deletes every entry carrying `tag` and reports the removed keys.
    ///
    /// Candidates come from the backend's membership set and from the local
    /// index. Each one is re-checked against its stored envelope under its key
    /// lock, so an entry rewritten without the tag in the meantime survives.
    pub async fn invalidate_tag_keys(&self, tag: &str) -> TagPurge {
        let tag_key = self.tag_key(tag);
        let mut purge = TagPurge::default();

        let mut candidates: BTreeSet<String> =
            self.state.read().await.index.keys_for(tag).into_iter().collect();
        match self.backend.set_members(&tag_key).await {
            Ok(members) => candidates.extend(members),
            Err(e) => {
                warn!(tag = %tag, error = %e, "Failed to read tag members; using local index only");
                purge.fail(e);
            }
        }

        for key in candidates {
            let _guard = self.key_lock(&key).lock().await;
            match self.purge_if_tagged(&key, tag).await {
                Ok(true) => purge.removed.push(key.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, tag = %tag, error = %e, "Failed to invalidate cache entry");
                    purge.fail(e);
                    continue;
                }
            }
            if let Err(e) = self.backend.remove_from_set(&tag_key, &key).await {
                debug!(key = %key, tag = %tag, error = %e, "Stale tag member left behind");
            }
        }

        let mut state = self.state.write().await;
        state.index.prune_tag(tag);
        state.stats.record_evictions(purge.removed.len() as u64);
        drop(state);

        if !purge.removed.is_empty() {
            info!(tag = %tag, keys_count = purge.removed.len(), "Cache invalidated by tag");
        }
        purge
    }

    /// Deletes `key` if its stored envelope still carries `tag`. Key lock held.
    async fn purge_if_tagged(&self, key: &str, tag: &str) -> Result<bool, CacheError> {
        let storage_key = self.storage_key(key);
        let stored = self
            .backend
            .get(&storage_key)
            .await?
            .map(|bytes| CacheEntry::from_bytes(&bytes));

        match stored {
            Some(Ok(entry)) if entry.tags.contains(tag) => {
                self.backend.delete(&storage_key).await?;
                self.state.write().await.index.remove(key);
                Ok(true)
            }
            Some(Ok(_)) => {
                // Retagged, possibly by another process.
                let mut state = self.state.write().await;
                if state.index.carries(key, tag) {
                    state.index.remove(key);
                }
                Ok(false)
            }
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                self.backend.delete(&storage_key).await?;
                self.state.write().await.index.remove(key);
                Ok(false)
            }
            None => {
                self.state.write().await.index.remove(key);
                Ok(false)
            }
        }
    }

    // == Cleanup Expired ==
    /// Removes every tracked entry whose TTL has elapsed.
    ///
    /// Returns the number of entries removed. Only reclaims memory; reads
    /// never depend on it.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired = self.state.read().await.index.expired_keys(now);
        let mut removed = 0;

        for key in expired {
            let _guard = self.key_lock(&key).lock().await;
            let still_expired = self
                .state
                .read()
                .await
                .index
                .record(&key)
                .is_some_and(|record| record.expires_at <= now);
            if !still_expired {
                continue;
            }
            if let Err(e) = self.backend.delete(&self.storage_key(&key)).await {
                warn!(key = %key, error = %e, "Failed to delete expired entry from backend");
            }
            self.state.write().await.index.remove(&key);
            removed += 1;
        }

        removed
    }

    // == Clear ==
    /// Drops every entry and tag set under this store's prefix.
    ///
    /// Returns the number of entries dropped.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let keys = self
            .backend
            .keys_matching(&format!("{}*", self.key_prefix))
            .await?;
        let count = keys.len();
        for key in &keys {
            self.backend.delete(key).await?;
        }
        for tag_key in self.backend.keys_matching(&self.tag_key("*")).await? {
            self.backend.delete(&tag_key).await?;
        }
        self.state.write().await.index.clear();

        info!(keys_count = count, "Cache cleared");
        Ok(count)
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        stats.set_tracked_keys(state.index.len());
        stats
    }

    /// Number of keys tracked by the tag index.
    pub async fn len(&self) -> usize {
        self.state.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.index.is_empty()
    }

    /// Tags currently recorded for `key`.
    pub async fn tags_of(&self, key: &str) -> Option<BTreeSet<String>> {
        self.state
            .read()
            .await
            .index
            .record(key)
            .map(|record| record.tags.clone())
    }

    #[cfg(test)]
    pub(crate) async fn index_is_consistent(&self) -> bool {
        self.state.read().await.index.is_consistent()
    }
}
