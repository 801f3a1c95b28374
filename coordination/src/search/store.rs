//! Vector store and embedder collaborators, with in-process implementations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::lexical::tokenize;
use super::types::{SearchError, SearchFilters, VectorHit, VectorPoint};
use crate::resilience::ErrorCategory;

/// Dense vector index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest neighbours of `vector`, best first.
    async fn search(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, SearchError>;

    /// Insert or replace points by id.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), SearchError>;
}

/// Text to vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Brute-force cosine index held in memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    points: RwLock<Vec<VectorPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, SearchError> {
        let points = self.points.read().await;
        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|p| filters.matches(&p.payload))
            .map(|p| VectorHit {
                id: p.id.clone(),
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn upsert(&self, new_points: Vec<VectorPoint>) -> Result<(), SearchError> {
        let mut points = self.points.write().await;
        for point in new_points {
            match points.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => points.push(point),
            }
        }
        Ok(())
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each token is hashed into one of `dimension` buckets with a hashed sign;
/// the result is L2-normalised. No model, no network: good enough for
/// development corpora and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(SearchError::Embedding {
                message: "text has no indexable tokens".to_string(),
                category: ErrorCategory::Permanent,
            });
        }
        let mut v = vec![0.0f32; self.dimension];
        for token in tokens {
            let mut h = DefaultHasher::new();
            token.hash(&mut h);
            let hash = h.finish();
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::types::{Payload, TEXT_KEY};
    use serde_json::json;

    fn point(id: &str, vector: Vec<f32>, lang: &str) -> VectorPoint {
        let mut payload = Payload::new();
        payload.insert(TEXT_KEY.into(), json!(format!("doc {id}")));
        payload.insert("lang".into(), json!(lang));
        VectorPoint {
            id: id.into(),
            vector,
            payload,
        }
    }

    #[test]
    fn test_cosine() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_search_ranks_and_filters() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "it"),
                point("b", vec![0.7, 0.7], "it"),
                point("c", vec![1.0, 0.1], "en"),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], &SearchFilters::none(), 2)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let hits = store
            .search(&[1.0, 0.0], &SearchFilters::none().eq("lang", "it"), 5)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert(vec![point("a", vec![1.0, 0.0], "it")]).await.unwrap();
        store.upsert(vec![point("a", vec![0.0, 1.0], "en")]).await.unwrap();
        assert_eq!(store.len().await, 1);
        let hits = store
            .search(&[0.0, 1.0], &SearchFilters::none().eq("lang", "en"), 1)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalised() {
        let e = HashingEmbedder::new(64);
        let v1 = e.embed("VAT registration deadline").await.unwrap();
        let v2 = e.embed("vat registration deadline").await.unwrap();
        assert_eq!(v1, v2);
        let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed("  ...  ").await.is_err());
    }
}
