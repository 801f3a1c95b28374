//! Per-provider circuit breaker.
//!
//! The breaker tracks consecutive failures per provider name. When failures
//! reach the configured threshold the circuit *opens* and the provider is
//! skipped until `opened_until`. The first admission after the cooldown moves
//! the circuit to *half-open* and lets exactly one probe through: a success
//! closes it, a failure re-opens it for another cooldown.
//!
//! Only the gateway's call path mutates breaker state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Healthy: requests allowed.
    Closed,
    /// Tripped: requests blocked until cooldown expires.
    Open,
    /// Cooldown expired: one probe request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker record for one provider.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub provider_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Wall-clock time of the last failure, for observability.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Monotonic deadline after which an open circuit admits a probe.
    pub opened_until: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreakerState {
    fn new(provider_name: &str) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_until: None,
            probe_in_flight: false,
        }
    }
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; normal call.
    Allowed,
    /// Circuit half-open; this call is the single recovery probe.
    Probe,
    /// Circuit open (or a probe is already running).
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Per-provider circuit breakers sharing one threshold and cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    providers: HashMap<String, CircuitBreakerState>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time an open circuit stays open before a probe is admitted.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn entry(&mut self, provider: &str) -> &mut CircuitBreakerState {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreakerState::new(provider))
    }

    /// Decide whether a call to `provider` may proceed, moving an expired
    /// open circuit to half-open.
    pub fn admit(&mut self, provider: &str) -> Admission {
        let now = Instant::now();
        let state = self.entry(provider);
        match state.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let expired = state.opened_until.map(|t| now >= t).unwrap_or(true);
                if expired {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    info!(provider, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Admission::Rejected
                } else {
                    state.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a success: resets circuit to Closed.
    pub fn record_success(&mut self, provider: &str) {
        let state = self.entry(provider);
        if state.state != CircuitState::Closed {
            info!(provider, from = %state.state, "circuit closed");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_until = None;
        state.probe_in_flight = false;
    }

    /// Record a failure: may trip circuit to Open.
    pub fn record_failure(&mut self, provider: &str) {
        let threshold = self.failure_threshold;
        let cooldown = self.cooldown;
        let state = self.entry(provider);
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());
        state.probe_in_flight = false;

        let trip = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.consecutive_failures >= threshold,
            CircuitState::Open => true,
        };
        if trip {
            if state.state != CircuitState::Open {
                warn!(
                    provider,
                    failures = state.consecutive_failures,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
            state.state = CircuitState::Open;
            state.opened_until = Some(Instant::now() + cooldown);
        }
    }

    /// Release a probe slot without an outcome (the call was cancelled).
    pub fn abandon_probe(&mut self, provider: &str) {
        if let Some(state) = self.providers.get_mut(provider) {
            state.probe_in_flight = false;
        }
    }

    /// Current state of the circuit for `provider`.
    ///
    /// Read-only: an open circuit whose cooldown elapsed reports `HalfOpen`
    /// without being moved there.
    pub fn state(&self, provider: &str) -> CircuitState {
        match self.providers.get(provider) {
            None => CircuitState::Closed,
            Some(s) if s.state == CircuitState::Open => {
                let expired = s.opened_until.map(|t| Instant::now() >= t).unwrap_or(true);
                if expired {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            Some(s) => s.state,
        }
    }

    /// Whether `provider` would currently admit a call.
    pub fn is_available(&self, provider: &str) -> bool {
        match self.providers.get(provider) {
            Some(s) if s.state == CircuitState::HalfOpen => !s.probe_in_flight,
            _ => !matches!(self.state(provider), CircuitState::Open),
        }
    }

    /// Consecutive failures recorded for `provider`.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.providers
            .get(provider)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Snapshot of a provider's breaker record.
    pub fn snapshot(&self, provider: &str) -> CircuitBreakerState {
        self.providers
            .get(provider)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerState::new(provider))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
