//! Collective memory: facts shared across users.
//!
//! Counts how many distinct users have stated each (normalised) fact and
//! exposes the most common ones as anonymous insights for prompt building.
//! Only the fact text and a count are kept; user ids are hashed per fact so
//! a repeat from the same user does not inflate the count. The number of
//! tracked facts is bounded: a new fact arriving at capacity evicts the one
//! with the fewest users, least recently seen first.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::errors::MemoryError;

/// A fact seen across several users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveInsight {
    pub fact: String,
    pub user_count: usize,
}

/// Cross-user aggregation of accepted facts.
#[async_trait]
pub trait CollectiveMemory: Send + Sync {
    /// Prepare the aggregator. Failure leaves the memory service degraded.
    async fn initialize(&self) -> Result<(), MemoryError>;

    /// Record facts newly saved for `user_id`.
    async fn record(&self, user_id: &str, facts: &[String]) -> Result<(), MemoryError>;

    /// Facts shared by at least `min_users` users, most common first.
    async fn top_insights(&self, limit: usize) -> Result<Vec<CollectiveInsight>, MemoryError>;
}

struct Tally {
    display: String,
    users: HashSet<u64>,
    last_seen: u64,
}

#[derive(Default)]
struct Tallies {
    facts: HashMap<String, Tally>,
    clock: u64,
}

/// Process-local [`CollectiveMemory`].
pub struct InMemoryCollectiveMemory {
    tallies: RwLock<Tallies>,
    min_users: usize,
    capacity: usize,
}

impl InMemoryCollectiveMemory {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(min_users: usize) -> Self {
        Self {
            tallies: RwLock::new(Tallies::default()),
            min_users: min_users.max(1),
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    /// Bound the number of distinct facts tracked.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Distinct facts currently tracked.
    pub async fn len(&self) -> usize {
        self.tallies.read().await.facts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryCollectiveMemory {
    fn default() -> Self {
        Self::new(2)
    }
}

fn user_hash(user_id: &str) -> u64 {
    let mut h = DefaultHasher::new();
    user_id.hash(&mut h);
    h.finish()
}

fn normalise(fact: &str) -> String {
    fact.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl CollectiveMemory for InMemoryCollectiveMemory {
    async fn initialize(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn record(&self, user_id: &str, facts: &[String]) -> Result<(), MemoryError> {
        if facts.is_empty() {
            return Ok(());
        }
        let uid = user_hash(user_id);
        let mut tallies = self.tallies.write().await;
        for fact in facts {
            let key = normalise(fact);
            if key.is_empty() {
                continue;
            }
            tallies.clock += 1;
            let now = tallies.clock;
            if !tallies.facts.contains_key(&key) && tallies.facts.len() >= self.capacity {
                evict_weakest(&mut tallies.facts);
            }
            let tally = tallies.facts.entry(key).or_insert_with(|| Tally {
                display: fact.trim().to_string(),
                users: HashSet::new(),
                last_seen: now,
            });
            tally.users.insert(uid);
            tally.last_seen = now;
        }
        Ok(())
    }

    async fn top_insights(&self, limit: usize) -> Result<Vec<CollectiveInsight>, MemoryError> {
        let tallies = self.tallies.read().await;
        let mut insights: Vec<CollectiveInsight> = tallies
            .facts
            .values()
            .filter(|t| t.users.len() >= self.min_users)
            .map(|t| CollectiveInsight {
                fact: t.display.clone(),
                user_count: t.users.len(),
            })
            .collect();
        insights.sort_by(|a, b| {
            b.user_count
                .cmp(&a.user_count)
                .then_with(|| a.fact.cmp(&b.fact))
        });
        insights.truncate(limit);
        Ok(insights)
    }
}

/// Drop the fact with the fewest users, least recently seen on ties.
fn evict_weakest(facts: &mut HashMap<String, Tally>) {
    let victim = facts
        .iter()
        .min_by_key(|(_, t)| (t.users.len(), t.last_seen))
        .map(|(k, _)| k.clone());
    if let Some(key) = victim {
        facts.remove(&key);
        debug!(fact = %key, "evicted collective fact tally");
    }
}
