//! Resilience: error taxonomy, backoff, and service status.
//!
//! Every failure that crosses a component boundary is reduced to one of three
//! categories before a retry decision is made:
//!
//! | Category   | Examples                                        | Policy                         |
//! |------------|-------------------------------------------------|--------------------------------|
//! | Transient  | timeout, connection reset, 429, 5xx, exhausted  | retry (fallback chain/backoff) |
//! | Permanent  | validation, auth, not found, 4xx, syntax        | surface immediately            |
//! | Unknown    | anything unrecognised                           | treated as transient, bounded  |
//!
//! Unknown errors are retried like transient ones. Callers must bound the
//! number of attempts (`max_fallback_depth` in the gateway, `max_attempts` in
//! [`BackoffPolicy`]) so that a non-idempotent permanent failure misfiled as
//! unknown cannot be retried indefinitely.

use std::error::Error;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::ProviderError;

/// Retry category for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network, timeout, rate limit, resource exhausted, 5xx.
    Transient,
    /// Validation, auth, not found, 4xx, syntax.
    Permanent,
    /// Unclassified.
    Unknown,
}

impl ErrorCategory {
    /// Whether a retry (next provider or backoff) is allowed.
    ///
    /// Unknown counts as retriable.
    pub fn is_retriable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify an error by walking its source chain.
///
/// Known concrete types are inspected first; the message heuristics of
/// [`classify_message`] are the last resort.
pub fn classify(err: &(dyn Error + 'static)) -> ErrorCategory {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(category) = classify_known(e) {
            return category;
        }
        current = e.source();
    }
    classify_message(&err.to_string())
}

fn classify_known(e: &(dyn Error + 'static)) -> Option<ErrorCategory> {
    if let Some(provider) = e.downcast_ref::<ProviderError>() {
        return Some(provider.category());
    }
    if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(ErrorCategory::Transient);
    }
    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return classify_io_kind(io.kind());
    }
    if let Some(http) = e.downcast_ref::<reqwest::Error>() {
        if http.is_timeout() || http.is_connect() {
            return Some(ErrorCategory::Transient);
        }
        if let Some(status) = http.status() {
            return Some(classify_status(status.as_u16()));
        }
        if http.is_builder() || http.is_decode() {
            return Some(ErrorCategory::Permanent);
        }
        return None;
    }
    if e.downcast_ref::<serde_json::Error>().is_some() {
        return Some(ErrorCategory::Permanent);
    }
    None
}

fn classify_io_kind(kind: std::io::ErrorKind) -> Option<ErrorCategory> {
    use std::io::ErrorKind::*;
    match kind {
        TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | BrokenPipe | WouldBlock | Interrupted | UnexpectedEof | AddrNotAvailable => {
            Some(ErrorCategory::Transient)
        }
        InvalidInput | InvalidData | PermissionDenied | NotFound | Unsupported | AlreadyExists => {
            Some(ErrorCategory::Permanent)
        }
        // `Other` and friends carry no signal; fall through to the message.
        _ => None,
    }
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> ErrorCategory {
    match status {
        408 | 425 | 429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        400..=499 => ErrorCategory::Permanent,
        _ => ErrorCategory::Unknown,
    }
}

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(time[d ]?out|timed out|connection|reset by peer|temporar|rate.?limit|\b429\b|\b50[0-4]\b|unavailable|resource.?exhausted|overloaded|try again|deadline exceeded)",
    )
    .expect("TRANSIENT_RE regex should compile")
});

static PERMANENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(invalid|validation|unauthori[sz]ed|forbidden|not found|bad request|\b40[0134]\b|\b422\b|syntax|permission denied|api key|no module named|import ?error|missing dependency|malformed)",
    )
    .expect("PERMANENT_RE regex should compile")
});

/// Classify a bare error message.
///
/// Transient markers win over permanent ones: "invalid response (503)" is
/// an upstream outage, not a caller mistake.
pub fn classify_message(message: &str) -> ErrorCategory {
    if TRANSIENT_RE.is_match(message) {
        ErrorCategory::Transient
    } else if PERMANENT_RE.is_match(message) {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Unknown
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Run `attempt_fn` until it succeeds, fails permanently, or the policy's
/// attempts are used up.
///
/// `categorize` decides whether an error is worth another attempt.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    operation: &str,
    mut attempt_fn: F,
    categorize: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorCategory,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let category = categorize(&e);
                if !category.is_retriable() {
                    debug!(operation, attempt, error = %e, "permanent failure, not retrying");
                    return Err(e);
                }
                if attempt + 1 >= max_attempts {
                    warn!(operation, attempts = attempt + 1, error = %e, "retries exhausted");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %category,
                    error = %e,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Operational status of a service.
///
/// Ordered from best to worst so `max()` over components gives the overall
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Every sub-service initialised.
    Healthy,
    /// Core reads/writes work; optional features are off.
    Degraded,
    /// Critical dependency missing; calls fail fast.
    Unavailable,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
