//! Search value types and errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::ErrorCategory;

/// Arbitrary document metadata stored alongside a vector.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Payload key holding the passage text.
pub const TEXT_KEY: &str = "text";

/// Which scoring path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Dense,
    Bm25,
    Hybrid,
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dense => write!(f, "dense"),
            Self::Bm25 => write!(f, "bm25"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    pub source: ResultSource,
}

/// Raw hit from the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

impl VectorHit {
    pub fn text(&self) -> &str {
        self.payload
            .get(TEXT_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }
}

/// A vector to write to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A document to index: text plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Payload,
}

/// Exact-match metadata filters; every condition must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub must: BTreeMap<String, serde_json::Value>,
}

impl SearchFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.must.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.must
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }
}

/// Search failure surfaced to the caller. Lexical problems never appear
/// here; they degrade the request to dense-only instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("embedding failed ({category}): {message}")]
    Embedding {
        message: String,
        category: ErrorCategory,
    },

    #[error("vector store failed ({category}): {message}")]
    VectorStore {
        message: String,
        category: ErrorCategory,
    },
}

impl SearchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyQuery => ErrorCategory::Permanent,
            Self::Embedding { category, .. } | Self::VectorStore { category, .. } => *category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters_match_all_conditions() {
        let mut payload = Payload::new();
        payload.insert("lang".into(), json!("it"));
        payload.insert("year".into(), json!(2024));

        assert!(SearchFilters::none().matches(&payload));
        assert!(SearchFilters::none().eq("lang", "it").matches(&payload));
        assert!(!SearchFilters::none()
            .eq("lang", "it")
            .eq("year", 2023)
            .matches(&payload));
        assert!(!SearchFilters::none().eq("missing", true).matches(&payload));
    }

    #[test]
    fn test_hit_text_defaults_to_empty() {
        let hit = VectorHit {
            id: "d1".into(),
            score: 0.5,
            payload: Payload::new(),
        };
        assert_eq!(hit.text(), "");
    }
}
