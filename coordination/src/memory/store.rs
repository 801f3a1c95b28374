//! Memory store: per-user facts, summary, and counters.
//!
//! Defines the [`MemoryStore`] trait consumed by the orchestrator and an
//! in-memory implementation. Every store must apply a [`MemoryUpdate`]
//! atomically: a concurrent `load_context` sees the record either before or
//! after the update, never in between.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::errors::MemoryError;

/// Everything the system remembers about one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub user_id: String,
    /// Oldest first; the last entry is the most recent fact.
    pub profile_facts: Vec<String>,
    pub summary: String,
    pub counters: BTreeMap<String, i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemoryContext {
    /// Context for a user the store has never seen.
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            profile_facts: Vec::new(),
            summary: String::new(),
            counters: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.profile_facts.is_empty() && self.summary.is_empty() && self.counters.is_empty()
    }

    /// The `n` most recent facts, oldest first.
    pub fn recent_facts(&self, n: usize) -> &[String] {
        let start = self.profile_facts.len().saturating_sub(n);
        &self.profile_facts[start..]
    }
}

/// Which candidate facts are worth storing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactPolicy {
    pub min_chars: usize,
    pub max_chars: usize,
    /// Stored facts per user; the oldest are evicted beyond this.
    pub max_facts: usize,
}

impl Default for FactPolicy {
    fn default() -> Self {
        Self {
            min_chars: 8,
            max_chars: 280,
            max_facts: 200,
        }
    }
}

impl FactPolicy {
    /// Filter `candidates` against `existing`, returning the facts to append.
    ///
    /// Facts are trimmed, length-checked, and deduplicated case-insensitively
    /// against both the stored facts and each other.
    pub fn accept(&self, existing: &[String], candidates: &[String]) -> Vec<String> {
        let mut seen: std::collections::HashSet<String> =
            existing.iter().map(|f| f.trim().to_lowercase()).collect();
        let mut accepted = Vec::new();
        for candidate in candidates {
            let fact = candidate.trim();
            let chars = fact.chars().count();
            if chars < self.min_chars || chars > self.max_chars {
                continue;
            }
            if seen.insert(fact.to_lowercase()) {
                accepted.push(fact.to_string());
            }
        }
        accepted
    }

    /// Append accepted facts to `facts` in place and evict the oldest beyond
    /// `max_facts`. Returns how many candidates were saved.
    pub fn apply(&self, facts: &mut Vec<String>, candidates: &[String]) -> usize {
        let accepted = self.accept(facts, candidates);
        let saved = accepted.len();
        facts.extend(accepted);
        if self.max_facts > 0 && facts.len() > self.max_facts {
            let excess = facts.len() - self.max_facts;
            facts.drain(..excess);
        }
        saved
    }
}

/// One atomic change to a user's record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryUpdate {
    /// Candidate facts, filtered by `policy` inside the store's transaction.
    pub facts: Vec<String>,
    /// Replaces the stored summary when set.
    pub summary: Option<String>,
    pub counter_deltas: BTreeMap<String, i64>,
    pub policy: FactPolicy,
}

impl MemoryUpdate {
    pub fn with_facts(mut self, facts: Vec<String>) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn increment(mut self, counter: &str, by: i64) -> Self {
        *self.counter_deltas.entry(counter.to_string()).or_insert(0) += by;
        self
    }

    pub fn with_policy(mut self, policy: FactPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Persistence for per-user memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Establish the backing connection. Called once by `initialize()`.
    async fn connect(&self) -> Result<(), MemoryError>;

    /// Snapshot of the user's record, or an empty context for a new user.
    async fn load_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError>;

    /// Apply `update` atomically. Returns the number of facts saved.
    async fn apply_update(&self, user_id: &str, update: MemoryUpdate)
        -> Result<usize, MemoryError>;
}

/// Process-local store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    records: RwLock<HashMap<String, MemoryContext>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users with a stored record.
    pub async fn user_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn connect(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn load_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError> {
        Ok(self
            .records
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| MemoryContext::empty(user_id)))
    }

    async fn apply_update(
        &self,
        user_id: &str,
        update: MemoryUpdate,
    ) -> Result<usize, MemoryError> {
        let mut records = self.records.write().await;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| MemoryContext::empty(user_id));
        let saved = update.policy.apply(&mut record.profile_facts, &update.facts);
        if let Some(summary) = update.summary {
            record.summary = summary;
        }
        for (name, delta) in update.counter_deltas {
            *record.counters.entry(name).or_insert(0) += delta;
        }
        record.updated_at = Some(Utc::now());
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_policy_trims_and_dedupes() {
        let policy = FactPolicy::default();
        let existing = strings(&["Works as a tax advisor"]);
        let accepted = policy.accept(
            &existing,
            &strings(&[
                "  works as a TAX advisor ",
                "Lives in Milan, Italy",
                "lives in milan, italy",
                "short",
            ]),
        );
        assert_eq!(accepted, strings(&["Lives in Milan, Italy"]));
    }

    #[test]
    fn test_policy_rejects_overlong_facts() {
        let policy = FactPolicy {
            max_chars: 20,
            ..FactPolicy::default()
        };
        let accepted = policy.accept(&[], &strings(&["this sentence is far too long to keep"]));
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_policy_evicts_oldest() {
        let policy = FactPolicy {
            min_chars: 1,
            max_chars: 100,
            max_facts: 3,
        };
        let mut facts = strings(&["one", "two", "three"]);
        let saved = policy.apply(&mut facts, &strings(&["four", "five"]));
        assert_eq!(saved, 2);
        assert_eq!(facts, strings(&["three", "four", "five"]));
    }

    #[test]
    fn test_recent_facts() {
        let mut ctx = MemoryContext::empty("u");
        ctx.profile_facts = strings(&["a", "b", "c"]);
        assert_eq!(ctx.recent_facts(2), &strings(&["b", "c"])[..]);
        assert_eq!(ctx.recent_facts(10).len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_update_is_visible() {
        let store = InMemoryMemoryStore::new();
        assert!(store.load_context("u1").await.unwrap().is_empty());

        let update = MemoryUpdate::default()
            .with_facts(strings(&["Prefers email contact"]))
            .with_summary(Some("Asks about VAT".into()))
            .increment("conversations", 1);
        assert_eq!(store.apply_update("u1", update).await.unwrap(), 1);

        let ctx = store.load_context("u1").await.unwrap();
        assert_eq!(ctx.profile_facts, strings(&["Prefers email contact"]));
        assert_eq!(ctx.summary, "Asks about VAT");
        assert_eq!(ctx.counters["conversations"], 1);
        assert!(ctx.updated_at.is_some());
        assert_eq!(store.user_count().await, 1);
    }
}
