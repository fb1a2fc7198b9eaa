//! Cache Entry Module
//!
//! Defines the envelope stored in the key-value backend for each cached
//! response, with TTL and tag metadata.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

// == Priority ==
/// Relative importance of a cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        f.write_str(name)
    }
}

// == Cache Entry ==
/// A single cached payload with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical cache key
    pub key: String,
    /// Encoded payload (JSON)
    pub payload: Vec<u8>,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds)
    pub expires_at: u64,
    /// Invalidation tags
    pub tags: BTreeSet<String>,
    /// Relative importance
    pub priority: Priority,
    /// Number of hits served from this entry
    #[serde(default)]
    pub access_count: u64,
    /// Last hit timestamp (Unix milliseconds)
    pub last_accessed_at: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry expiring `ttl_seconds` after `now_ms`.
    ///
    /// A zero TTL is clamped to one millisecond so that
    /// `expires_at > created_at` always holds.
    pub fn new(
        key: impl Into<String>,
        payload: Vec<u8>,
        now_ms: u64,
        ttl_seconds: u64,
        tags: BTreeSet<String>,
        priority: Priority,
    ) -> Self {
        let ttl_ms = ttl_seconds.saturating_mul(1000).max(1);
        Self {
            key: key.into(),
            payload,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            tags,
            priority,
            access_count: 0,
            last_accessed_at: now_ms,
        }
    }

    // == Is Expired ==
    /// An entry is expired once `now >= expires_at`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Remaining lifetime in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }

    /// Remaining lifetime in whole seconds, rounded up, as the backend TTL.
    pub fn ttl_remaining_secs(&self, now_ms: u64) -> u64 {
        self.ttl_remaining_ms(now_ms).div_ceil(1000)
    }

    // == Envelope Encoding ==
    /// Encodes the entry for the key-value backend.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an entry read from the key-value backend.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
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
    fn test_entry_creation() {
        let entry = CacheEntry::new("k", b"{}".to_vec(), 1_000, 60, tags(&["a"]), Priority::High);

        assert_eq!(entry.created_at, 1_000);
        assert_eq!(entry.expires_at, 61_000);
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.last_accessed_at, 1_000);
        assert!(entry.expires_at > entry.created_at);
    }

    #[test]
    fn test_zero_ttl_still_expires_after_creation() {
        let entry = CacheEntry::new("k", vec![], 5_000, 0, BTreeSet::new(), Priority::Low);
        assert!(entry.expires_at > entry.created_at);
        assert!(entry.is_expired_at(5_001));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = CacheEntry::new("k", vec![], 0, 60, BTreeSet::new(), Priority::Normal);

        assert!(!entry.is_expired_at(59_999));
        assert!(entry.is_expired_at(60_000), "Entry should be expired at boundary");
    }

    #[test]
    fn test_ttl_remaining() {
        let entry = CacheEntry::new("k", vec![], 0, 10, BTreeSet::new(), Priority::Normal);

        assert_eq!(entry.ttl_remaining_ms(2_500), 7_500);
        assert_eq!(entry.ttl_remaining_secs(2_500), 8);
        assert_eq!(entry.ttl_remaining_ms(20_000), 0);
    }

    #[test]
    fn test_envelope_encoding() {
        let entry = CacheEntry::new("k", b"[1,2]".to_vec(), 0, 10, tags(&["x", "y"]), Priority::Medium);
        let bytes = entry.to_bytes().unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["priority"], "medium");

        assert_eq!(CacheEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_decoding_garbage_is_serialization_error() {
        let result = CacheEntry::from_bytes(b"not json");
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
