//! Gateway error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::provider::ProviderError;
use super::registry::Tier;
use crate::resilience::ErrorCategory;

/// Why a provider in the chain was not called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    Unavailable,
    /// `max_fallback_depth` calls were already made.
    DepthExceeded,
}

/// What happened to one provider during a gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Skipped { reason: SkipReason },
    Failed { category: ErrorCategory, message: String },
}

/// One entry in the aggregate failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl ProviderAttempt {
    pub fn skipped(provider: &str, reason: SkipReason) -> Self {
        Self {
            provider: provider.to_string(),
            outcome: AttemptOutcome::Skipped { reason },
        }
    }

    pub fn failed(provider: &str, error: &ProviderError) -> Self {
        Self {
            provider: provider.to_string(),
            outcome: AttemptOutcome::Failed {
                category: error.category(),
                message: error.to_string(),
            },
        }
    }

    pub fn was_called(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Failed { .. })
    }
}

fn summarize(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| match &a.outcome {
            AttemptOutcome::Skipped { reason } => format!("{} skipped ({:?})", a.provider, reason),
            AttemptOutcome::Failed { category, .. } => format!("{} failed ({})", a.provider, category),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of a whole gateway call.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No provider is registered for the tier or any tier below it.
    #[error("no providers configured for tier {0}")]
    NoProviders(Tier),

    /// Every provider in the chain was skipped or failed.
    #[error("all providers exhausted for tier {tier}: {}", summarize(.attempts))]
    Exhausted {
        tier: Tier,
        attempts: Vec<ProviderAttempt>,
    },

    /// A provider returned a permanent error; the chain was abandoned.
    #[error("request rejected by {provider}: {error}")]
    Aborted {
        provider: String,
        error: ProviderError,
        attempts: Vec<ProviderAttempt>,
    },

    /// A stream failed after output had already been emitted.
    #[error("stream from {provider} interrupted: {message}")]
    StreamInterrupted {
        provider: String,
        category: ErrorCategory,
        message: String,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Retry category of the failure as seen by the caller.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoProviders(_) => ErrorCategory::Permanent,
            Self::Exhausted { .. } => ErrorCategory::Transient,
            Self::Aborted { .. } => ErrorCategory::Permanent,
            Self::StreamInterrupted { category, .. } => *category,
            Self::Cancelled => ErrorCategory::Permanent,
        }
    }

    /// Stable machine-readable identifier for event payloads.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoProviders(_) => "no_providers",
            Self::Exhausted { .. } => "provider_exhausted",
            Self::Aborted { .. } => "request_rejected",
            Self::StreamInterrupted { .. } => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Providers tried or skipped before the failure, if any.
    pub fn attempts(&self) -> &[ProviderAttempt] {
        match self {
            Self::Exhausted { attempts, .. } | Self::Aborted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}
