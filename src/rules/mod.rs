//! Rule Engine Module
//!
//! Resolves a request path to the [`OptimizationRule`] that governs it.
//!
//! Resolution is longest-prefix-match over enabled rules; among equally long
//! patterns the first registered wins. Paths matching no rule get the default
//! rule: cached for the default TTL, not deduplicated.

mod rule;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use tracing::info;

use crate::cache::Priority;

pub use rule::{KeyGenerator, OptimizationRule, RuleSpec};

// == Rule Engine ==
#[derive(Debug)]
pub struct RuleEngine {
    /// Registered rules in registration order
    rules: RwLock<Vec<Arc<OptimizationRule>>>,
    default_rule: Arc<OptimizationRule>,
}

impl RuleEngine {
    // == Constructor ==
    /// Creates an engine with no rules and the given fallback TTL.
    pub fn new(default_ttl: u64) -> Self {
        let default_rule = OptimizationRule::new("", default_ttl).with_dedupe(false);
        Self {
            rules: RwLock::new(Vec::new()),
            default_rule: Arc::new(default_rule),
        }
    }

    /// Creates an engine pre-loaded with `rules`.
    pub fn with_rules(default_ttl: u64, rules: impl IntoIterator<Item = OptimizationRule>) -> Self {
        let engine = Self::new(default_ttl);
        for rule in rules {
            engine.add_rule(rule);
        }
        engine
    }

    // == Add Rule ==
    /// Registers `rule`. A rule with the same pattern is replaced in place,
    /// keeping its registration position.
    ///
    /// Returns true if an existing rule was replaced.
    pub fn add_rule(&self, rule: OptimizationRule) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule = Arc::new(rule);

        if let Some(slot) = rules.iter_mut().find(|r| r.pattern == rule.pattern) {
            *slot = rule;
            true
        } else {
            rules.push(rule);
            false
        }
    }

    // == Resolve ==
    /// Returns the rule governing `path`.
    pub fn resolve(&self, path: &str) -> Arc<OptimizationRule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<&Arc<OptimizationRule>> = None;
        for rule in rules.iter().filter(|r| r.matches(path)) {
            // Strictly longer only, so the earliest wins a tie.
            if best.map_or(true, |b| rule.pattern.len() > b.pattern.len()) {
                best = Some(rule);
            }
        }

        best.cloned().unwrap_or_else(|| self.default_rule.clone())
    }

    // == Global Tags ==
    /// Adds `tags` to every registered rule, skipping ones already present.
    pub fn add_global_tags(&self, tags: &[String]) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter_mut() {
            let rule = Arc::make_mut(rule);
            for tag in tags {
                if !rule.tags.contains(tag) {
                    rule.tags.push(tag.clone());
                }
            }
        }
        info!(tags = ?tags, "Added global cache tags");
    }

    /// Snapshot of the registered rules in registration order.
    pub fn rules(&self) -> Vec<Arc<OptimizationRule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_rule(&self) -> Arc<OptimizationRule> {
        self.default_rule.clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tags used by any registered rule.
    pub fn known_tags(&self) -> BTreeSet<String> {
        self.rules()
            .iter()
            .flat_map(|rule| rule.tags.iter().cloned())
            .collect()
    }
}

// == Built-in Rules ==
/// Rules registered when no rules file is configured.
pub fn builtin_rules() -> Vec<OptimizationRule> {
    vec![
        OptimizationRule::new("/api/health", 60)
            .with_tags(["health"])
            .with_priority(Priority::High),
        OptimizationRule::new("/api/stats", 30)
            .with_tags(["stats"])
            .with_priority(Priority::Medium),
        OptimizationRule::new("/api/users/profile", 600)
            .with_tags(["user", "profile"])
            .with_priority(Priority::Medium)
            .with_key_generator(|req| {
                format!("user:{}:profile", req.header("x-user-id").unwrap_or("anonymous"))
            }),
        OptimizationRule::new("/api/courses/list", 300)
            .with_tags(["courses", "list"])
            .with_priority(Priority::Medium),
    ]
}

// == Rules File ==
/// Reads a JSON array of [`RuleSpec`]s.
pub fn load_rules_file(path: &Path) -> anyhow::Result<Vec<OptimizationRule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    let specs: Vec<RuleSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid rules file {}", path.display()))?;

    info!(path = %path.display(), rules = specs.len(), "Loaded optimization rules");
    Ok(specs.into_iter().map(RuleSpec::into_rule).collect())
}
