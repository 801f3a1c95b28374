//! Hybrid Search Service: dense retrieval with optional BM25 rescoring.
//!
//! # Lexical lifecycle
//!
//! ```text
//! Pending ──claim──▶ Initializing ──init Ok──────────────▶ Enabled
//!                        │  ──init Permanent──────────▶ Disabled (process lifetime)
//!                        │  ──init Transient, retries exhausted──▶ Pending (cooling off)
//!                        │  ──initialising search dropped──▶ Pending
//! Enabled ──score Permanent──────▶ Disabled
//! Enabled ──score Transient──────▶ Enabled (this request dense-only)
//! ```
//!
//! One search claims initialisation and runs the retries with the state
//! lock released. Searches arriving meanwhile serve dense-only instead of
//! waiting on the backoff. Once disabled, searches skip the lexical path
//! without any retry cost and tag their results `dense`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::lexical::{LexicalError, LexicalScorer};
use super::store::{Embedder, VectorStore};
use super::types::{
    Document, ResultSource, SearchError, SearchFilters, SearchResult, VectorHit, VectorPoint,
    TEXT_KEY,
};
use crate::resilience::{duration_millis, retry_with_backoff, BackoffPolicy, ErrorCategory};

/// Hybrid search tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub dense_weight: f32,
    pub lexical_weight: f32,
    /// Dense hits fetched per requested result when rescoring lexically.
    pub candidate_multiplier: usize,
    pub default_top_k: usize,
    /// Timeout for each embedder and vector store call.
    #[serde(rename = "request_timeout_ms", with = "duration_millis")]
    pub request_timeout: Duration,
    /// Backoff for transient lexical initialisation failures.
    pub lexical_backoff: BackoffPolicy,
    /// Time to wait before retrying an initialisation that ran out of retries.
    #[serde(rename = "lexical_retry_after_ms", with = "duration_millis")]
    pub lexical_retry_after: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dense_weight: 0.6,
            lexical_weight: 0.4,
            candidate_multiplier: 4,
            default_top_k: 5,
            request_timeout: Duration::from_secs(10),
            lexical_backoff: BackoffPolicy::default(),
            lexical_retry_after: Duration::from_secs(60),
        }
    }
}

/// Observable lexical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LexicalStatus {
    Pending,
    /// A search is initialising the scorer; others run dense-only meanwhile.
    Initializing,
    Enabled,
    Disabled { reason: String },
}

#[derive(Debug)]
enum LexicalState {
    Pending { retry_after: Option<Instant> },
    Initializing,
    Enabled,
    Disabled { reason: String },
}

/// Dense + lexical retrieval with graceful degradation.
pub struct HybridSearchService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    scorer: Option<Arc<dyn LexicalScorer>>,
    lexical: Mutex<LexicalState>,
    config: SearchConfig,
}

impl HybridSearchService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: SearchConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            scorer: None,
            lexical: Mutex::new(LexicalState::Disabled {
                reason: "no lexical scorer configured".to_string(),
            }),
            config,
        }
    }

    pub fn with_lexical(mut self, scorer: Arc<dyn LexicalScorer>) -> Self {
        self.scorer = Some(scorer);
        self.lexical = Mutex::new(LexicalState::Pending { retry_after: None });
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, LexicalState> {
        self.lexical.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lexical state. Never waits on an initialisation in progress.
    pub async fn lexical_status(&self) -> LexicalStatus {
        match &*self.state() {
            LexicalState::Pending { .. } => LexicalStatus::Pending,
            LexicalState::Initializing => LexicalStatus::Initializing,
            LexicalState::Enabled => LexicalStatus::Enabled,
            LexicalState::Disabled { reason } => LexicalStatus::Disabled {
                reason: reason.clone(),
            },
        }
    }

    /// Initialise the lexical scorer now instead of on first search.
    ///
    /// Returns `Initializing` without waiting if a search already claimed
    /// the initialisation.
    pub async fn initialize_lexical(&self) -> LexicalStatus {
        self.ensure_lexical(true).await;
        self.lexical_status().await
    }

    /// Whether the lexical path may run for this request.
    async fn ensure_lexical(&self, force: bool) -> bool {
        let Some(scorer) = &self.scorer else {
            return false;
        };
        {
            let mut state = self.state();
            match &*state {
                LexicalState::Enabled => return true,
                LexicalState::Disabled { .. } | LexicalState::Initializing => return false,
                LexicalState::Pending {
                    retry_after: Some(at),
                } if !force && Instant::now() < *at => return false,
                LexicalState::Pending { .. } => {}
            }
            *state = LexicalState::Initializing;
        }
        let claim = InitClaim {
            lexical: &self.lexical,
            settled: false,
        };

        let result = retry_with_backoff(
            &self.config.lexical_backoff,
            "lexical_init",
            |_| scorer.initialize(),
            |e: &LexicalError| e.category,
        )
        .await;
        match result {
            Ok(()) => {
                info!("lexical scoring enabled");
                claim.settle(LexicalState::Enabled);
                true
            }
            Err(e) if e.category == ErrorCategory::Permanent => {
                warn!(error = %e, "lexical scoring disabled for process lifetime");
                claim.settle(LexicalState::Disabled { reason: e.message });
                false
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_after_ms = self.config.lexical_retry_after.as_millis() as u64,
                    "lexical init failed, serving dense-only for now"
                );
                claim.settle(LexicalState::Pending {
                    retry_after: Some(Instant::now() + self.config.lexical_retry_after),
                });
                false
            }
        }
    }

    fn disable_lexical(&self, reason: String) {
        let mut state = self.state();
        if !matches!(*state, LexicalState::Disabled { .. }) {
            warn!(reason = %reason, "lexical scoring disabled after query-time failure");
            *state = LexicalState::Disabled { reason };
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        tokio::time::timeout(self.config.request_timeout, self.embedder.embed(text))
            .await
            .unwrap_or_else(|_| {
                Err(SearchError::Embedding {
                    message: "embedding timed out".to_string(),
                    category: ErrorCategory::Transient,
                })
            })
    }

    /// Top `top_k` passages for `query`. `top_k == 0` uses the configured default.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let top_k = if top_k == 0 {
            self.config.default_top_k
        } else {
            top_k
        };
        let started = Instant::now();

        let vector = self.embed(query).await?;
        let lexical = self.ensure_lexical(false).await;
        let pool = if lexical {
            top_k.saturating_mul(self.config.candidate_multiplier.max(1))
        } else {
            top_k
        };

        let hits = tokio::time::timeout(
            self.config.request_timeout,
            self.store.search(&vector, filters, pool),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SearchError::VectorStore {
                message: "vector search timed out".to_string(),
                category: ErrorCategory::Transient,
            })
        })?;

        let results = if lexical && !hits.is_empty() {
            match self.rescore(query, &hits) {
                Ok(lexical_scores) => merge(
                    &hits,
                    &lexical_scores,
                    self.config.dense_weight,
                    self.config.lexical_weight,
                    top_k,
                ),
                Err(e) => {
                    if e.category == ErrorCategory::Permanent {
                        self.disable_lexical(e.message.clone());
                    } else {
                        warn!(error = %e, "lexical scoring failed, dense-only for this query");
                    }
                    dense_only(hits, top_k)
                }
            }
        } else {
            dense_only(hits, top_k)
        };

        debug!(
            results = results.len(),
            lexical,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(results)
    }

    fn rescore(&self, query: &str, hits: &[VectorHit]) -> Result<Vec<f32>, LexicalError> {
        let Some(scorer) = &self.scorer else {
            return Err(LexicalError::new("no lexical scorer", ErrorCategory::Permanent));
        };
        let texts: Vec<String> = hits.iter().map(|h| h.text().to_string()).collect();
        let scores = scorer.score(query, &texts)?;
        if scores.len() != texts.len() {
            return Err(LexicalError::new(
                format!("scorer returned {} scores for {} documents", scores.len(), texts.len()),
                ErrorCategory::Transient,
            ));
        }
        Ok(scores)
    }

    /// Embed and upsert documents.
    pub async fn index_documents(&self, documents: &[Document]) -> Result<usize, SearchError> {
        let mut points = Vec::with_capacity(documents.len());
        for doc in documents {
            let vector = self.embed(&doc.text).await?;
            let mut payload = doc.metadata.clone();
            payload.insert(TEXT_KEY.to_string(), serde_json::Value::String(doc.text.clone()));
            points.push(VectorPoint {
                id: doc.id.clone(),
                vector,
                payload,
            });
        }
        let count = points.len();
        tokio::time::timeout(self.config.request_timeout, self.store.upsert(points))
            .await
            .unwrap_or_else(|_| {
                Err(SearchError::VectorStore {
                    message: "upsert timed out".to_string(),
                    category: ErrorCategory::Transient,
                })
            })?;
        Ok(count)
    }
}

/// Ownership of an in-progress lexical initialisation. Dropping it unsettled
/// (the initialising search was cancelled) hands the next search the claim.
struct InitClaim<'a> {
    lexical: &'a Mutex<LexicalState>,
    settled: bool,
}

impl InitClaim<'_> {
    fn settle(mut self, next: LexicalState) {
        *self.lexical.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.settled = true;
    }
}

impl Drop for InitClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.lexical.lock().unwrap_or_else(PoisonError::into_inner) =
                LexicalState::Pending { retry_after: None };
        }
    }
}

fn dense_only(hits: Vec<VectorHit>, top_k: usize) -> Vec<SearchResult> {
    hits.into_iter()
        .take(top_k)
        .map(|h| SearchResult {
            text: h.text().to_string(),
            doc_id: h.id,
            score: h.score,
            source: ResultSource::Dense,
        })
        .collect()
}

/// Min-max normalise into [0, 1]. A constant column maps to 1 when positive.
fn normalise(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    scores
        .iter()
        .map(|&s| {
            if range > f32::EPSILON {
                (s - min) / range
            } else if max > 0.0 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn merge(
    hits: &[VectorHit],
    lexical: &[f32],
    dense_weight: f32,
    lexical_weight: f32,
    top_k: usize,
) -> Vec<SearchResult> {
    let dense: Vec<f32> = hits.iter().map(|h| h.score).collect();
    let dense = normalise(&dense);
    let lexical = normalise(lexical);
    let mut results: Vec<SearchResult> = hits
        .iter()
        .zip(dense.iter().zip(&lexical))
        .map(|(hit, (d, l))| SearchResult {
            doc_id: hit.id.clone(),
            text: hit.text().to_string(),
            score: dense_weight * d + lexical_weight * l,
            source: ResultSource::Hybrid,
        })
        .collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    results.truncate(top_k);
    results
}
