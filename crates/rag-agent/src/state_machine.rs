//! Turn State Machine: explicit states and legal transition guards.
//!
//! Every turn walks the same graph so that the event stream a client sees
//! can be reconstructed from the transition log:
//!
//! ```text
//! Received → ContextLoaded → Retrieved → Generating ─┬─▶ Streaming → Done
//!                                                    └─▶ Verifying ─┘
//! (any non-terminal) → Error
//! ```
//!
//! The orchestrator calls `advance()` between pipeline stages. Each call
//! validates the edge and appends it to the transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Stages of one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Request accepted, correlation id assigned.
    Received,
    /// User memory loaded (or skipped because memory is unavailable).
    ContextLoaded,
    /// Passages retrieved (possibly none).
    Retrieved,
    /// Waiting on the LLM gateway.
    Generating,
    /// Checking a complete answer before it is streamed.
    Verifying,
    /// Emitting token events.
    Streaming,
    /// `done` emitted: terminal state.
    Done,
    /// Fatal error emitted: terminal state.
    Error,
}

impl TurnState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::ContextLoaded => write!(f, "context_loaded"),
            Self::Retrieved => write!(f, "retrieved"),
            Self::Generating => write!(f, "generating"),
            Self::Verifying => write!(f, "verifying"),
            Self::Streaming => write!(f, "streaming"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

fn is_legal_transition(from: TurnState, to: TurnState) -> bool {
    use TurnState::*;

    if to == Error && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Received, ContextLoaded)
            | (ContextLoaded, Retrieved)
            | (Retrieved, Generating)
            | (Generating, Verifying)
            | (Generating, Streaming)
            | (Verifying, Streaming)
            | (Streaming, Done)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TurnState,
    pub to: TurnState,
    /// Milliseconds since the turn was received.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: TurnState,
    pub to: TurnState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal turn transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// State of one turn plus its transition log.
pub struct TurnStateMachine {
    current: TurnState,
    correlation_id: String,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl TurnStateMachine {
    /// Create a new state machine starting at `Received`.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            current: TurnState::Received,
            correlation_id: correlation_id.into(),
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> TurnState {
        self.current
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Attempt to advance to the next state.
    pub fn advance(&mut self, to: TurnState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                from = %self.current,
                to = %to,
                "Rejected turn transition"
            );
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            correlation_id = %self.correlation_id,
            from = %self.current,
            to = %to,
            elapsed_ms = record.elapsed_ms,
            "Turn transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Error` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TurnState::Error, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// One-line history, e.g. `received → done (12ms, 5 transitions) [...]`.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            TurnState::Received,
            self.current,
            self.elapsed_ms(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            out.push_str(&format!(" [{}]", states.join(" → ")));
        }
        out
    }
}
