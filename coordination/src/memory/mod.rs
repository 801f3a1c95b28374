//! Long-term per-user memory.
//!
//! # Modules
//!
//! - [`store`]: `MemoryStore` trait, `MemoryContext`, fact acceptance policy, in-memory store
//! - [`sql`]: relational store over the `SqlPool` / `SqlConnection` interface
//! - [`locks`]: LRU-bounded per-user write locks
//! - [`extractor`]: pattern and LLM fact extractors
//! - [`collective`]: cross-user insight aggregation
//! - [`orchestrator`]: lifecycle, read limiter, serialised writes
//! - [`errors`]: `MemoryError`

pub mod collective;
pub mod errors;
pub mod extractor;
pub mod locks;
pub mod orchestrator;
pub mod sql;
pub mod store;

pub use collective::{CollectiveInsight, CollectiveMemory, InMemoryCollectiveMemory};
pub use errors::MemoryError;
pub use extractor::{Extraction, FactExtractor, LlmFactExtractor, PatternFactExtractor};
pub use locks::UserLockRegistry;
pub use orchestrator::{
    MemoryConfig, MemoryHealth, MemoryOrchestrator, MemoryProcessResult,
    OrchestratorServiceStatus,
};
pub use sql::{SqlConnection, SqlError, SqlMemoryStore, SqlPool, SqlRow, SqlValue};
pub use store::{FactPolicy, InMemoryMemoryStore, MemoryContext, MemoryStore, MemoryUpdate};
