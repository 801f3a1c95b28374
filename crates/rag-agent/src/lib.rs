//! Agentic turn orchestrator for the conversational RAG service.
//!
//! Drives one question through memory lookup, hybrid retrieval, generation
//! and optional verification, streaming [`StreamEvent`]s to the caller:
//!
//! ```text
//! received ─▶ context_loaded ─▶ retrieved ─▶ generating ─┬─▶ streaming ─▶ done
//!                                                       └─▶ verifying ─▶ streaming
//!                (any non-terminal state) ─▶ error
//! ```
//!
//! The resilience primitives (gateway, memory, search) live in the
//! `rag-coordination` crate; this crate composes them.

pub mod app;
pub mod config;
pub mod events;
pub mod memory_writer;
pub mod orchestrator;
pub mod pg;
pub mod prompt;
pub mod sanitize;
pub mod state_machine;
pub mod status;
pub mod telemetry;
pub mod verifier;

pub use app::{build_app, App};
pub use config::{ConfigError, RagConfig};
pub use events::{EventType, StreamEvent};
pub use memory_writer::{MemoryWriteJob, MemoryWriteQueue};
pub use orchestrator::{AgenticOrchestrator, OrchestratorConfig, TurnError, TurnRequest};
pub use state_machine::{TurnState, TurnStateMachine};
pub use status::{StatusProbe, StatusReport};
pub use telemetry::{TurnOutcome, TurnRecord};
