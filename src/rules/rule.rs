//! Optimization Rule Module
//!
//! A rule says how long responses under a path prefix may be reused, whether
//! concurrent identical requests are coalesced, and how they are keyed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::Priority;
use crate::request::RequestDescriptor;

/// Custom cache-key derivation for a rule.
pub type KeyGenerator = Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>;

// == Optimization Rule ==
#[derive(Clone)]
pub struct OptimizationRule {
    /// Path prefix this rule applies to
    pub pattern: String,
    /// Cache lifetime in seconds; 0 disables caching
    pub ttl_seconds: u64,
    /// Coalesce concurrent identical requests
    pub dedupe_enabled: bool,
    /// Tags attached to cached responses
    pub tags: Vec<String>,
    pub priority: Priority,
    /// Disabled rules never match
    pub enabled: bool,
    /// Replaces the canonical request key when present
    pub key_generator: Option<KeyGenerator>,
}

impl fmt::Debug for OptimizationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationRule")
            .field("pattern", &self.pattern)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("dedupe_enabled", &self.dedupe_enabled)
            .field("tags", &self.tags)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("custom_key", &self.key_generator.is_some())
            .finish()
    }
}

impl OptimizationRule {
    // == Constructor ==
    /// Creates an enabled, deduplicating rule with no tags.
    pub fn new(pattern: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            pattern: pattern.into(),
            ttl_seconds,
            dedupe_enabled: true,
            tags: Vec::new(),
            priority: Priority::Normal,
            enabled: true,
            key_generator: None,
        }
    }

    pub fn with_dedupe(mut self, dedupe_enabled: bool) -> Self {
        self.dedupe_enabled = dedupe_enabled;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    // == Queries ==
    /// True if responses under this rule are cached at all.
    pub fn caches(&self) -> bool {
        self.ttl_seconds > 0
    }

    pub fn matches(&self, path: &str) -> bool {
        self.enabled && path.starts_with(&self.pattern)
    }

    /// Key used for both the cache and the deduplicator.
    pub fn cache_key(&self, request: &RequestDescriptor) -> String {
        match &self.key_generator {
            Some(generator) => generator(request),
            None => request.cache_key(),
        }
    }

    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags.iter().cloned().collect()
    }
}

// == Rule Spec ==
/// Serializable rule definition, as read from a rules file or the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub dedupe: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Key responses by this header's value instead of the full request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_by_header: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RuleSpec {
    /// Builds the runtime rule.
    ///
    /// A `key_by_header` spec keys on `"{pattern}:{header}:{value}"`, with
    /// `anonymous` standing in for a missing header.
    pub fn into_rule(self) -> OptimizationRule {
        let rule = OptimizationRule::new(self.pattern, self.ttl_seconds)
            .with_dedupe(self.dedupe)
            .with_tags(self.tags)
            .with_priority(self.priority)
            .with_enabled(self.enabled);

        match self.key_by_header {
            Some(header) => {
                let pattern = rule.pattern.clone();
                rule.with_key_generator(move |req| {
                    let value = req.header(&header).unwrap_or("anonymous");
                    format!("{}:{}:{}", pattern, header, value)
                })
            }
            None => rule,
        }
    }
}
