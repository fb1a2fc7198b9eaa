//! Tag Index Module
//!
//! Tracks which cache keys carry which invalidation tags.
//!
//! Two maps are kept in step:
//! - Forward: key -> record (tags, expiry, access stats)
//! - Reverse: tag -> set of keys
//!
//! The forward record is the source of truth. The reverse map is only used to
//! find candidates and is re-checked against the forward record before any
//! deletion.

use std::collections::{BTreeSet, HashMap, HashSet};

// == Key Record ==
/// In-process metadata for one cached key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Tags the live entry carries
    pub tags: BTreeSet<String>,
    /// Expiration timestamp (Unix milliseconds)
    pub expires_at: u64,
    /// Number of hits served
    pub access_count: u64,
    /// Last hit timestamp (Unix milliseconds)
    pub last_accessed_at: u64,
}

// == Tag Index ==
#[derive(Debug, Default)]
pub struct TagIndex {
    by_key: HashMap<String, KeyRecord>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Register ==
    /// Records `key` under `tags`, replacing any previous association.
    ///
    /// Old tags are unlinked before the new ones are installed so an
    /// overwrite never leaves the key under a tag it no longer carries.
    pub fn register(&mut self, key: &str, tags: BTreeSet<String>, expires_at: u64, now_ms: u64) {
        self.remove(key);

        for tag in &tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        self.by_key.insert(
            key.to_string(),
            KeyRecord {
                tags,
                expires_at,
                access_count: 0,
                last_accessed_at: now_ms,
            },
        );
    }

    // == Remove ==
    /// Forgets `key` and scrubs it from every tag it was registered under.
    pub fn remove(&mut self, key: &str) -> Option<KeyRecord> {
        let record = self.by_key.remove(key)?;

        for tag in &record.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }

        Some(record)
    }

    // == Lookups ==
    /// Snapshot of the keys currently listed under `tag`.
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        self.by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True if the forward record of `key` carries `tag`.
    pub fn carries(&self, key: &str, tag: &str) -> bool {
        self.by_key
            .get(key)
            .is_some_and(|record| record.tags.contains(tag))
    }

    pub fn record(&self, key: &str) -> Option<&KeyRecord> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Drops reverse entries under `tag` whose forward record no longer
    /// carries it, and the tag itself once empty.
    pub fn prune_tag(&mut self, tag: &str) {
        let Some(keys) = self.by_tag.get_mut(tag) else {
            return;
        };
        let by_key = &self.by_key;
        keys.retain(|key| by_key.get(key).is_some_and(|r| r.tags.contains(tag)));
        if keys.is_empty() {
            self.by_tag.remove(tag);
        }
    }

    // == Access Tracking ==
    pub fn record_access(&mut self, key: &str, now_ms: u64) {
        if let Some(record) = self.by_key.get_mut(key) {
            record.access_count += 1;
            record.last_accessed_at = now_ms;
        }
    }

    // == Expiry ==
    /// Keys whose recorded expiry has passed.
    pub fn expired_keys(&self, now_ms: u64) -> Vec<String> {
        self.by_key
            .iter()
            .filter(|(_, record)| now_ms >= record.expires_at)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.by_key.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_tag.clear();
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }

    /// Checks that both maps describe the same relation.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let forward_ok = self.by_key.iter().all(|(key, record)| {
            record
                .tags
                .iter()
                .all(|tag| self.by_tag.get(tag).is_some_and(|keys| keys.contains(key)))
        });
        let reverse_ok = self
            .by_tag
            .iter()
            .all(|(tag, keys)| !keys.is_empty() && keys.iter().all(|key| self.carries(key, tag)));
        forward_ok && reverse_ok
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut index = TagIndex::new();
        index.register("k1", tags(&["a", "b"]), 100, 0);
        index.register("k2", tags(&["b"]), 100, 0);

        let mut under_b = index.keys_for("b");
        under_b.sort();
        assert_eq!(under_b, vec!["k1", "k2"]);
        assert_eq!(index.keys_for("a"), vec!["k1"]);
        assert!(index.carries("k1", "a"));
        assert!(!index.carries("k2", "a"));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_overwrite_unlinks_old_tags() {
        let mut index = TagIndex::new();
        index.register("k1", tags(&["old"]), 100, 0);
        index.register("k1", tags(&["new"]), 100, 0);

        assert!(index.keys_for("old").is_empty());
        assert_eq!(index.keys_for("new"), vec!["k1"]);
        assert_eq!(index.tag_count(), 1);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_remove_scrubs_every_tag() {
        let mut index = TagIndex::new();
        index.register("k1", tags(&["a", "b", "c"]), 100, 0);

        let record = index.remove("k1").unwrap();
        assert_eq!(record.tags.len(), 3);
        assert_eq!(index.tag_count(), 0);
        assert!(index.is_empty());
        assert!(index.remove("k1").is_none());
    }

    #[test]
    fn test_record_access() {
        let mut index = TagIndex::new();
        index.register("k1", BTreeSet::new(), 100, 0);
        index.record_access("k1", 42);
        index.record_access("k1", 43);

        let record = index.record("k1").unwrap();
        assert_eq!(record.access_count, 2);
        assert_eq!(record.last_accessed_at, 43);
    }

    #[test]
    fn test_prune_tag_drops_stale_reverse_entries() {
        let mut index = TagIndex::new();
        index.register("k1", tags(&["t"]), 100, 0);
        index.register("k2", tags(&["t"]), 100, 0);
        index
            .by_tag
            .get_mut("t")
            .unwrap()
            .insert("ghost".to_string());

        index.prune_tag("t");
        let mut keys = index.keys_for("t");
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);

        index.remove("k1");
        index.remove("k2");
        index.prune_tag("t");
        assert_eq!(index.tag_count(), 0);
    }

    #[test]
    fn test_expired_keys() {
        let mut index = TagIndex::new();
        index.register("short", BTreeSet::new(), 10, 0);
        index.register("long", BTreeSet::new(), 1_000, 0);

        assert_eq!(index.expired_keys(10), vec!["short"]);
        assert!(index.expired_keys(9).is_empty());
    }
}
