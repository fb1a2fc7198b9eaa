//! Cache Module
//!
//! Response cache with per-entry TTL and tag-based invalidation.

mod clock;
mod entry;
mod stats;
mod store;
mod tags;


// Re-export public types
pub use clock::{current_timestamp_ms, Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, Priority};
pub use stats::CacheStats;
pub use store::{CacheStore, TagPurge};
pub use tags::{KeyRecord, TagIndex};

// == Public Constants ==
/// Default prefix for cache keys in the backend
pub const DEFAULT_KEY_PREFIX: &str = "cache:";
