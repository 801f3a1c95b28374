//! Memory error taxonomy.
//!
//! Every failure in the memory read/write paths maps to one variant here.
//! `Clone` so the orchestrator can hand the same initialisation error to
//! every later caller.

use thiserror::Error;

use crate::resilience::ErrorCategory;

/// Failure in the memory store, extractor, or orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    /// The orchestrator is `UNAVAILABLE`; no I/O was attempted.
    #[error("memory service unavailable: {0}")]
    Unavailable(String),

    /// The store could not be reached during `initialize()`.
    #[error("memory store connection failed ({category}): {message}")]
    StoreConnect {
        message: String,
        category: ErrorCategory,
    },

    /// A store read or write failed after a successful connection.
    #[error("memory store error ({category}): {message}")]
    Store {
        message: String,
        category: ErrorCategory,
    },

    /// Fact extraction failed.
    #[error("fact extraction failed: {0}")]
    Extraction(String),

    /// Collective-memory aggregation failed.
    #[error("collective memory error: {0}")]
    Collective(String),

    /// `initialize()` has not run yet.
    #[error("memory orchestrator not initialized")]
    NotInitialized,
}

impl MemoryError {
    pub fn store(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self::Store {
            message: message.into(),
            category,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StoreConnect { category, .. } | Self::Store { category, .. } => *category,
            Self::Unavailable(_) | Self::NotInitialized => ErrorCategory::Permanent,
            Self::Extraction(_) | Self::Collective(_) => ErrorCategory::Unknown,
        }
    }

    /// Stable identifier for event payloads.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unavailable(_) | Self::NotInitialized => "memory_unavailable",
            Self::StoreConnect { .. } | Self::Store { .. } => "memory_store_error",
            Self::Extraction(_) => "fact_extraction_failed",
            Self::Collective(_) => "collective_memory_error",
        }
    }
}
