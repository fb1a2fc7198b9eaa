//! Key-Value Backend Module
//!
//! The storage seam underneath the cache store. Any store offering values
//! with a TTL, string sets and pattern listing can back the cache; an
//! in-process implementation is provided.
//!
//! Tag membership is kept in backend sets so every process sharing the
//! backend sees the same tags.

mod memory;

use async_trait::async_trait;

use crate::error::CacheError;

pub use memory::MemoryBackend;

/// Byte-oriented key-value store with per-key TTL.
///
/// Every method may fail with [`CacheError::BackendUnavailable`]; callers treat
/// that as a reason to bypass the cache, not as a request failure.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Reads a value. Expired values read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores a value that the backend drops after `ttl_seconds`.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), CacheError>;

    /// Removes the value or set at `key`. Returns true if one was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Adds `member` to the set at `key`. The set lives at least
    /// `ttl_seconds` from now.
    async fn add_to_set(&self, key: &str, member: &str, ttl_seconds: u64) -> Result<(), CacheError>;

    /// Members of the set at `key`; empty when there is no such set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Removes `member` from the set at `key`. Returns true if it was there.
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Lists keys matching a glob pattern (`*`, `?`, `[..]`).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Reclaims space held by expired values. Backends that expire values
    /// on their own keep the default no-op.
    async fn sweep_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}
