//! Lexical scoring: Okapi BM25 over the dense candidate pool.
//!
//! The scorer does not keep a corpus-wide index: it rescores the passages
//! the dense path already returned. IDF is therefore relative to the
//! candidate pool, which is why the service oversamples dense hits before
//! handing them over.
//!
//! ```text
//! score(D, Q) = Σ_q IDF(q) · f(q,D)·(k1+1) / (f(q,D) + k1·(1 − b + b·|D|/avgdl))
//! IDF(q)      = ln(1 + (N − n(q) + 0.5) / (n(q) + 0.5))
//! ```

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::resilience::ErrorCategory;

/// Lexical scoring failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("lexical scorer error ({category}): {message}")]
pub struct LexicalError {
    pub message: String,
    pub category: ErrorCategory,
}

impl LexicalError {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }
}

/// Sparse term-based scorer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LexicalScorer: Send + Sync {
    /// Load whatever the scorer needs. Called lazily before first use.
    async fn initialize(&self) -> Result<(), LexicalError>;

    /// One score per document, in input order.
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LexicalError>;
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Okapi BM25.
#[derive(Debug, Clone)]
pub struct Bm25Scorer {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[async_trait]
impl LexicalScorer for Bm25Scorer {
    async fn initialize(&self) -> Result<(), LexicalError> {
        if self.k1 < 0.0 || !(0.0..=1.0).contains(&self.b) {
            return Err(LexicalError::new(
                format!("invalid BM25 parameters k1={} b={}", self.k1, self.b),
                ErrorCategory::Permanent,
            ));
        }
        Ok(())
    }

    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LexicalError> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if documents.is_empty() || query_terms.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }

        let docs: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d)).collect();
        let n = docs.len() as f32;
        let avgdl = (docs.iter().map(Vec::len).sum::<usize>() as f32 / n).max(1.0);

        let mut df: HashMap<&str, usize> = HashMap::new();
        for doc in &docs {
            let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
            for term in unique {
                if query_terms.contains(term) {
                    *df.entry(term).or_insert(0) += 1;
                }
            }
        }

        let scores = docs
            .iter()
            .map(|doc| {
                let mut tf: HashMap<&str, usize> = HashMap::new();
                for token in doc {
                    if query_terms.contains(token.as_str()) {
                        *tf.entry(token.as_str()).or_insert(0) += 1;
                    }
                }
                let len_norm = 1.0 - self.b + self.b * doc.len() as f32 / avgdl;
                tf.iter()
                    .map(|(term, &f)| {
                        let n_q = df.get(term).copied().unwrap_or(0) as f32;
                        let idf = (1.0 + (n - n_q + 0.5) / (n_q + 0.5)).ln();
                        let f = f as f32;
                        idf * f * (self.k1 + 1.0) / (f + self.k1 * len_norm)
                    })
                    .sum()
            })
            .collect();
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("IVA, 22%!  Régime"), vec!["iva", "22", "régime"]);
    }

    #[test]
    fn test_matching_document_scores_higher() {
        let scorer = Bm25Scorer::default();
        let scores = scorer
            .score(
                "invoice deadline",
                &docs(&[
                    "the invoice deadline is the 15th",
                    "payroll is processed monthly",
                    "send the invoice by email",
                ]),
            )
            .unwrap();
        assert!(scores[0] > scores[2]);
        assert!(scores[2] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let scorer = Bm25Scorer::default();
        let scores = scorer
            .score(
                "tax forfettario",
                &docs(&["tax rules", "tax forms", "forfettario regime", "tax office"]),
            )
            .unwrap();
        // "forfettario" appears once in the pool, "tax" three times.
        assert!(scores[2] > scores[0]);
    }

    #[test]
    fn test_empty_inputs() {
        let scorer = Bm25Scorer::default();
        assert!(scorer.score("x", &[]).unwrap().is_empty());
        assert_eq!(scorer.score("", &docs(&["a b"])).unwrap(), vec![0.0]);
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_permanent() {
        let scorer = Bm25Scorer { k1: 1.2, b: 3.0 };
        let err = scorer.initialize().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Permanent);
    }
}
