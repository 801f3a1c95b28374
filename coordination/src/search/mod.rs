//! Passage retrieval.
//!
//! # Modules
//!
//! - [`types`]: `SearchResult`, `SearchFilters`, vector store value types, `SearchError`
//! - [`store`]: `VectorStore` and `Embedder` traits, in-memory index, hashing embedder
//! - [`lexical`]: `LexicalScorer` trait and BM25
//! - [`service`]: `HybridSearchService`

pub mod lexical;
pub mod service;
pub mod store;
pub mod types;

pub use lexical::{tokenize, Bm25Scorer, LexicalError, LexicalScorer};
pub use service::{HybridSearchService, LexicalStatus, SearchConfig};
pub use store::{cosine, Embedder, HashingEmbedder, InMemoryVectorStore, VectorStore};
pub use types::{
    Document, Payload, ResultSource, SearchError, SearchFilters, SearchResult, VectorHit,
    VectorPoint,
};
