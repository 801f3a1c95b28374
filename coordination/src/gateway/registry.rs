//! Provider Registry: tier, cost, and live health metadata
//!
//! Tracks which providers serve which tier, what they cost, and rolling
//! latency/error counters used to order the fallback chain.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::ProviderAdapter;

/// Quality/cost class of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Pro,
    Flash,
    Lite,
    Fallback,
}

impl Tier {
    /// All tiers from highest to lowest quality.
    pub fn all() -> &'static [Tier] {
        &[Tier::Pro, Tier::Flash, Tier::Lite, Tier::Fallback]
    }

    /// This tier followed by every lower tier.
    pub fn cascade(self) -> impl Iterator<Item = Tier> {
        Tier::all().iter().copied().filter(move |t| *t >= self)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pro => write!(f, "pro"),
            Self::Flash => write!(f, "flash"),
            Self::Lite => write!(f, "lite"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pro" => Ok(Self::Pro),
            "flash" => Ok(Self::Flash),
            "lite" => Ok(Self::Lite),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Price per 1k tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTable {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl CostTable {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Blended price assuming a 3:1 prompt/completion ratio.
    pub fn blended_per_1k(&self) -> f64 {
        (self.input_per_1k * 3.0 + self.output_per_1k) / 4.0
    }
}

/// Static description of a provider. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub name: String,
    pub tier: Tier,
    /// Lower values are tried first when costs tie.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub cost: CostTable,
}

fn default_available() -> bool {
    true
}

impl ProviderHandle {
    pub fn new(name: impl Into<String>, tier: Tier) -> Self {
        Self {
            name: name.into(),
            tier,
            priority: 0,
            available: true,
            cost: CostTable::default(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost: CostTable) -> Self {
        self.cost = cost;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// Live health metadata for a provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Exponentially weighted average latency in milliseconds.
    pub avg_latency_ms: f64,
    pub success_count: u64,
    pub error_count: u64,
}

impl ProviderHealth {
    const LATENCY_ALPHA: f64 = 0.3;

    /// Compute success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Record a successful request with latency
    pub fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms = if self.success_count == 0 {
            latency_ms as f64
        } else {
            Self::LATENCY_ALPHA * latency_ms as f64
                + (1.0 - Self::LATENCY_ALPHA) * self.avg_latency_ms
        };
        self.success_count += 1;
    }

    /// Record a failed request
    pub fn record_failure(&mut self) {
        self.error_count += 1;
    }
}

/// Cost scaled by observed latency (1s of average latency doubles the cost).
pub fn latency_weighted_cost(handle: &ProviderHandle, health: Option<&ProviderHealth>) -> f64 {
    let latency_s = health.map(|h| h.avg_latency_ms / 1000.0).unwrap_or(0.0);
    handle.cost.blended_per_1k() * (1.0 + latency_s)
}

/// A handle paired with the adapter that serves it.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub handle: ProviderHandle,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Ordered providers tried for one logical request.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    pub tier: Tier,
    pub providers: Vec<RegisteredProvider>,
}

impl FallbackChain {
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.handle.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Registry of all configured providers in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Declaration order breaks ordering ties.
    pub fn register(&mut self, handle: ProviderHandle, adapter: Arc<dyn ProviderAdapter>) {
        self.entries.push(RegisteredProvider { handle, adapter });
    }

    pub fn with(mut self, handle: ProviderHandle, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(handle, adapter);
        self
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProviderHandle> {
        self.entries.iter().map(|e| &e.handle)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|e| e.handle.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Providers of exactly `tier`, ordered by latency-weighted cost, then
    /// declared priority, then declaration order.
    pub fn ordered_for_tier(
        &self,
        tier: Tier,
        health: &HashMap<String, ProviderHealth>,
    ) -> Vec<RegisteredProvider> {
        let mut providers: Vec<RegisteredProvider> = self
            .entries
            .iter()
            .filter(|e| e.handle.tier == tier)
            .cloned()
            .collect();
        // `sort_by` is stable, so declaration order survives full ties.
        providers.sort_by(|a, b| {
            let ca = latency_weighted_cost(&a.handle, health.get(&a.handle.name));
            let cb = latency_weighted_cost(&b.handle, health.get(&b.handle.name));
            ca.partial_cmp(&cb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.handle.priority.cmp(&b.handle.priority))
        });
        providers
    }

    /// Full fallback chain: the requested tier first, then each lower tier.
    pub fn fallback_chain(
        &self,
        tier: Tier,
        health: &HashMap<String, ProviderHealth>,
    ) -> FallbackChain {
        let providers = tier
            .cascade()
            .flat_map(|t| self.ordered_for_tier(t, health))
            .collect();
        FallbackChain { tier, providers }
    }
}
