//! Provider adapter interface: one LLM backend behind a uniform API.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::{classify_message, classify_status, ErrorCategory};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a chat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Overrides the gateway's per-provider request timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A complete (non-streamed) provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: None,
        }
    }
}

/// Lazy sequence of text deltas from a provider.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// What went wrong inside a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    /// 5xx or explicit overload.
    Unavailable,
    Network,
    /// 4xx validation, malformed payload.
    InvalidRequest,
    Auth,
    NotFound,
    /// Unparseable body, unexpected shape, anything else.
    Other,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Network => write!(f, "network"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Auth => write!(f, "auth"),
            Self::NotFound => write!(f, "not_found"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Error returned by a [`ProviderAdapter`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    /// Map an HTTP error status to a provider error.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            400..=499 => ProviderErrorKind::InvalidRequest,
            500..=599 => ProviderErrorKind::Unavailable,
            _ => ProviderErrorKind::Other,
        };
        let body: String = body.chars().take(200).collect();
        Self::new(kind, format!("HTTP {status}: {body}"))
    }

    /// Retry category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self.kind {
            ProviderErrorKind::Timeout
            | ProviderErrorKind::RateLimited
            | ProviderErrorKind::Unavailable
            | ProviderErrorKind::Network => ErrorCategory::Transient,
            ProviderErrorKind::InvalidRequest
            | ProviderErrorKind::Auth
            | ProviderErrorKind::NotFound => ErrorCategory::Permanent,
            ProviderErrorKind::Other => match classify_message(&self.message) {
                // Status codes embedded in free text are more reliable than words.
                ErrorCategory::Unknown => status_hint(&self.message),
                category => category,
            },
        }
    }
}

fn status_hint(message: &str) -> ErrorCategory {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| s.len() == 3)
        .filter_map(|s| s.parse::<u16>().ok())
        .map(classify_status)
        .find(|c| *c != ErrorCategory::Unknown)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Uniform interface to one LLM provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name used for breaker bookkeeping and logs.
    fn name(&self) -> &str;

    /// Cheap local availability check (credentials present, not disabled).
    fn is_available(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<LlmResponse, ProviderError>;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChunkStream, ProviderError>;
}
