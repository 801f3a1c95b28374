//! RAG Coordination Library
//!
//! Resilience core of the conversational RAG agent:
//! - LLM gateway with tiered fallback chains and per-provider circuit breakers
//! - Memory orchestrator with per-user serialised writes and degraded-mode operation
//! - Hybrid dense + BM25 search with permanent lexical fallback
//!
//! # Component order (leaves first)
//!
//! ```text
//! ProviderAdapter ─┐
//! CircuitBreaker ──┴─▶ LlmGateway ─┐
//! Embedder / VectorStore / BM25 ───┼─▶ HybridSearchService
//! MemoryStore / FactExtractor ─────┴─▶ MemoryOrchestrator
//! ```
//!
//! Everything is constructed once at process start and passed by `Arc`;
//! there is no global state.

#![allow(clippy::uninlined_format_args)]

pub mod gateway;
pub mod memory;
pub mod resilience;
pub mod search;

// Re-export gateway types
pub use gateway::{
    ChatMessage, CircuitBreaker, CircuitState, GatewayConfig, GatewayError, GatewayResponse,
    GatewayStream, GenerateOptions, LlmGateway, ProviderAdapter, ProviderError, ProviderHandle,
    ProviderRegistry, ProviderStatus, Tier,
};

// Re-export memory types
pub use memory::{
    MemoryConfig, MemoryContext, MemoryError, MemoryOrchestrator, MemoryProcessResult,
    MemoryStore, OrchestratorServiceStatus,
};

// Re-export search types
pub use search::{
    HybridSearchService, ResultSource, SearchConfig, SearchError, SearchFilters, SearchResult,
};

// Re-export resilience types
pub use resilience::{classify, classify_message, BackoffPolicy, ErrorCategory, ServiceStatus};
