//! Agentic Orchestrator: drives one conversational turn end to end.
//!
//! ```text
//! Received ──memory──▶ ContextLoaded ──search──▶ Retrieved ──gateway──▶ Generating
//!                                                                          │
//!             ┌──────────── verify_answers ───────────────┬────────────────┘
//!             ▼                                           ▼
//!         Verifying ──────────────────────────────▶ Streaming ──▶ Done ──▶ memory write queue
//! ```
//!
//! # Failure policy
//!
//! | Failure | Event | Turn |
//! |---------|-------|------|
//! | memory read | `error` (`memory_unavailable`, non-fatal) | continues unpersonalised |
//! | search | `error` (`retrieval_unavailable`, non-fatal) | continues with no passages |
//! | verifier objects | `error` (`verification_failed`, non-fatal) | answer still streamed |
//! | gateway chain | `error` (fatal) | ends, no `done` |
//! | stream after first token | `error` (`stream_interrupted`, fatal) | ends, no replay |
//! | client disconnect | none | LLM call cancelled |
//!
//! Error messages are sanitised and capped before they leave the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use coordination::gateway::Tier;
use coordination::{
    ChatMessage, GatewayError, GenerateOptions, HybridSearchService, LlmGateway,
    MemoryOrchestrator, SearchFilters, SearchResult,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::events::{DoneData, StreamEvent};
use crate::memory_writer::{MemoryWriteJob, MemoryWriteQueue};
use crate::prompt::{PromptBuilder, PromptInputs};
use crate::sanitize::{sanitize_message, DEFAULT_MAX_CHARS};
use crate::state_machine::{IllegalTransition, TurnState, TurnStateMachine};
use crate::telemetry::{append_turn_record, TurnOutcome, TurnRecord, TurnTelemetry};
use crate::verifier::AnswerVerifier;

/// Turn pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tier used when the request carries no intent signal.
    pub default_tier: Tier,
    /// Generate the whole answer, verify it, then stream it.
    pub verify_answers: bool,
    /// Conversation messages carried into the prompt.
    pub history_window: usize,
    /// Passages requested from search; `None` uses the search default.
    pub top_k: Option<usize>,
    /// Collective insights added to the prompt.
    pub collective_insights: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Cap on user-visible error messages, in characters.
    pub max_error_chars: usize,
    /// Events buffered between the turn and a slow client.
    pub event_buffer: usize,
    pub write_queue_capacity: usize,
    pub write_concurrency: usize,
    /// Characters per `token` event when replaying a verified answer.
    pub replay_chunk_chars: usize,
    /// Append one JSON line per turn here.
    pub telemetry_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_tier: Tier::Flash,
            verify_answers: false,
            history_window: 6,
            top_k: None,
            collective_insights: 3,
            temperature: Some(0.2),
            max_tokens: None,
            max_error_chars: DEFAULT_MAX_CHARS,
            event_buffer: 64,
            write_queue_capacity: 256,
            write_concurrency: 4,
            replay_chunk_chars: 48,
            telemetry_path: None,
        }
    }
}

/// One user question.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub user_id: String,
    pub question: String,
    /// Tier picked by intent classification upstream.
    pub tier: Option<Tier>,
    pub history: Vec<ChatMessage>,
    pub filters: SearchFilters,
    /// Caller-supplied id; a fresh one is generated otherwise.
    pub correlation_id: Option<String>,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Failure that ends a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("client disconnected")]
    Disconnected,

    #[error(transparent)]
    State(#[from] IllegalTransition),
}

impl TurnError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Gateway(e) => e.error_type(),
            Self::Disconnected => "cancelled",
            Self::State(_) => "internal_error",
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Gateway(GatewayError::Cancelled))
    }
}

/// Event sender bound to one turn. A failed send means the client is gone:
/// the turn's token is cancelled so in-flight LLM calls stop.
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    correlation_id: String,
    max_error_chars: usize,
}

impl EventSink {
    async fn send(&self, event: StreamEvent) -> Result<(), TurnError> {
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
            return Err(TurnError::Disconnected);
        }
        Ok(())
    }

    async fn status(&self, stage: TurnState, message: Option<&str>) -> Result<(), TurnError> {
        self.send(StreamEvent::status(
            &self.correlation_id,
            &stage.to_string(),
            message,
        ))
        .await
    }

    async fn warning(&self, error_type: &str, detail: &str) -> Result<(), TurnError> {
        let message = sanitize_message(detail, self.max_error_chars);
        self.send(StreamEvent::error(
            &self.correlation_id,
            error_type,
            &message,
            false,
        ))
        .await
    }

    async fn fatal(&self, error_type: &str, detail: &str) -> Result<(), TurnError> {
        let message = sanitize_message(detail, self.max_error_chars);
        self.send(StreamEvent::error(
            &self.correlation_id,
            error_type,
            &message,
            true,
        ))
        .await
    }
}

/// Await `fut` unless the turn is cancelled first.
async fn or_cancel<F: std::future::Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, TurnError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TurnError::Disconnected),
        out = fut => Ok(out),
    }
}

/// Split text into chunks of about `max_chars`, breaking after whitespace.
/// Concatenating the chunks gives back the input.
pub fn chunk_answer(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;
    for piece in text.split_inclusive(char::is_whitespace) {
        let n = piece.chars().count();
        if current_chars > 0 && current_chars + n > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push_str(piece);
        current_chars += n;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Top-level turn pipeline over the gateway, memory and search services.
pub struct AgenticOrchestrator {
    gateway: Arc<LlmGateway>,
    memory: Arc<MemoryOrchestrator>,
    search: Arc<HybridSearchService>,
    verifier: Option<Arc<dyn AnswerVerifier>>,
    writes: Option<MemoryWriteQueue>,
    prompts: PromptBuilder,
    config: OrchestratorConfig,
}

impl AgenticOrchestrator {
    pub fn new(
        gateway: Arc<LlmGateway>,
        memory: Arc<MemoryOrchestrator>,
        search: Arc<HybridSearchService>,
        config: OrchestratorConfig,
    ) -> Self {
        let prompts = PromptBuilder::new().with_history_window(config.history_window);
        Self {
            gateway,
            memory,
            search,
            verifier: None,
            writes: None,
            prompts,
            config,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AnswerVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_write_queue(mut self, queue: MemoryWriteQueue) -> Self {
        self.writes = Some(queue);
        self
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    pub fn memory(&self) -> &Arc<MemoryOrchestrator> {
        &self.memory
    }

    pub fn search(&self) -> &Arc<HybridSearchService> {
        &self.search
    }

    pub fn write_queue(&self) -> Option<&MemoryWriteQueue> {
        self.writes.as_ref()
    }

    /// Run a turn on its own task and hand back the event stream.
    pub fn spawn_turn(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> (mpsc::Receiver<StreamEvent>, JoinHandle<TurnRecord>) {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_turn(request, tx).await });
        (rx, handle)
    }

    /// Run one turn, sending its events to `events`.
    ///
    /// Dropping the receiving side cancels the turn. The returned record
    /// describes how the turn ended.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> TurnRecord {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = info_span!(
            "turn",
            correlation_id = %correlation_id,
            user_id = %request.user_id
        );
        self.run_turn_inner(request, events, correlation_id)
            .instrument(span)
            .await
    }

    async fn run_turn_inner(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<StreamEvent>,
        correlation_id: String,
    ) -> TurnRecord {
        let tier = request.tier.unwrap_or(self.config.default_tier);
        let cancel = CancellationToken::new();
        let sink = EventSink {
            tx: events.clone(),
            cancel: cancel.clone(),
            correlation_id: correlation_id.clone(),
            max_error_chars: self.config.max_error_chars,
        };

        // Cancel the turn as soon as the client side goes away, even while
        // nothing is being sent.
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                events.closed().await;
                cancel.cancel();
            })
        };

        let mut sm = TurnStateMachine::new(correlation_id.clone());
        let mut telemetry = TurnTelemetry::new(&correlation_id, &request.user_id, &tier.to_string());
        info!(tier = %tier, "Turn received");

        let result = self
            .drive(&request, tier, &cancel, &sink, &mut sm, &mut telemetry)
            .await;
        watcher.abort();

        let record = match result {
            Ok(()) => telemetry.finish(TurnOutcome::Done, None),
            Err(e) if e.is_cancellation() || cancel.is_cancelled() => {
                let _ = sm.fail("client disconnected");
                info!("Turn cancelled by client");
                telemetry.finish(TurnOutcome::Cancelled, Some("cancelled"))
            }
            Err(e) => {
                let error_type = e.error_type();
                let _ = sm.fail(error_type);
                warn!(error_type, error = %e, "Turn failed");
                let _ = sink.fatal(error_type, &e.to_string()).await;
                telemetry.finish(TurnOutcome::Error, Some(error_type))
            }
        };

        debug!(history = %sm.summary(), "Turn state history");
        record.emit();
        if let Some(path) = self.config.telemetry_path.clone() {
            let line = record.clone();
            let _ = tokio::task::spawn_blocking(move || append_turn_record(&line, &path)).await;
        }
        record
    }

    async fn drive(
        &self,
        request: &TurnRequest,
        tier: Tier,
        cancel: &CancellationToken,
        sink: &EventSink,
        sm: &mut TurnStateMachine,
        telemetry: &mut TurnTelemetry,
    ) -> Result<(), TurnError> {
        if request.user_id.trim().is_empty() {
            return Err(TurnError::InvalidRequest("user id is required".into()));
        }
        if request.question.trim().is_empty() {
            return Err(TurnError::InvalidRequest("question is empty".into()));
        }
        sink.status(TurnState::Received, None).await?;

        // Context
        let started = Instant::now();
        let memory = match or_cancel(cancel, self.memory.get_user_context(&request.user_id)).await? {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(error_type = e.error_type(), error = %e, "Memory context unavailable");
                telemetry.record_warning();
                sink.warning("memory_unavailable", &format!("personal memory unavailable: {e}"))
                    .await?;
                None
            }
        };
        let insights = if memory.is_some() && self.config.collective_insights > 0 {
            or_cancel(
                cancel,
                self.memory.collective_insights(self.config.collective_insights),
            )
            .await?
        } else {
            Vec::new()
        };
        telemetry.record_context(memory.is_some(), started.elapsed());
        sm.advance(
            TurnState::ContextLoaded,
            memory.is_none().then_some("memory unavailable"),
        )?;
        sink.status(TurnState::ContextLoaded, None).await?;

        // Retrieval
        let started = Instant::now();
        let top_k = self
            .config
            .top_k
            .unwrap_or(self.search.config().default_top_k);
        let passages: Vec<SearchResult> = match or_cancel(
            cancel,
            self.search.search(&request.question, &request.filters, top_k),
        )
        .await?
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Retrieval failed, answering without passages");
                telemetry.record_warning();
                sink.warning("retrieval_unavailable", &format!("document search unavailable: {e}"))
                    .await?;
                Vec::new()
            }
        };
        telemetry.record_retrieval(passages.len(), started.elapsed());
        sm.advance(TurnState::Retrieved, None)?;
        let retrieved = format!("{} passages", passages.len());
        sink.status(TurnState::Retrieved, Some(&retrieved)).await?;

        // Generation
        let messages = self.prompts.build(PromptInputs {
            question: &request.question,
            memory: memory.as_ref(),
            insights: &insights,
            passages: &passages,
            history: &request.history,
        });
        let options = GenerateOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: None,
        };
        sm.advance(TurnState::Generating, None)?;
        sink.status(TurnState::Generating, None).await?;

        let started = Instant::now();
        let verifier = self
            .verifier
            .as_ref()
            .filter(|_| self.config.verify_answers);
        let (provider, provider_tier, fallbacks, answer, verified) = match verifier {
            Some(verifier) => {
                let response = self
                    .gateway
                    .generate(tier, &messages, &options, cancel)
                    .await?;
                telemetry.record_provider(&response.provider, response.fallbacks.len());

                sm.advance(TurnState::Verifying, Some(verifier.name()))?;
                sink.status(TurnState::Verifying, None).await?;
                let verified = match verifier
                    .verify(&request.question, &response.content, &passages, cancel)
                    .await
                {
                    Ok(verdict) if verdict.passed => Some(true),
                    Ok(verdict) => {
                        telemetry.record_warning();
                        sink.warning("verification_failed", &verdict.feedback).await?;
                        Some(false)
                    }
                    Err(GatewayError::Cancelled) => return Err(TurnError::Disconnected),
                    Err(e) => {
                        warn!(error = %e, "Verifier unavailable, streaming unverified answer");
                        telemetry.record_warning();
                        sink.warning("verification_unavailable", &e.to_string())
                            .await?;
                        None
                    }
                };
                if let Some(passed) = verified {
                    telemetry.record_verification(passed);
                }

                sm.advance(TurnState::Streaming, None)?;
                for chunk in chunk_answer(&response.content, self.config.replay_chunk_chars) {
                    telemetry.record_token(&chunk);
                    sink.send(StreamEvent::token(&sink.correlation_id, &chunk))
                        .await?;
                }
                (
                    response.provider,
                    response.tier,
                    response.fallbacks.len(),
                    response.content,
                    verified,
                )
            }
            None => {
                let mut stream = self.gateway.stream(tier, &messages, &options, cancel).await?;
                telemetry.record_provider(&stream.provider, stream.fallbacks.len());
                sm.advance(TurnState::Streaming, None)?;

                let mut answer = String::new();
                while let Some(item) = or_cancel(cancel, stream.next()).await? {
                    let chunk = item?;
                    if chunk.is_empty() {
                        continue;
                    }
                    telemetry.record_token(&chunk);
                    sink.send(StreamEvent::token(&sink.correlation_id, &chunk))
                        .await?;
                    answer.push_str(&chunk);
                }
                (
                    stream.provider.clone(),
                    stream.tier,
                    stream.fallbacks.len(),
                    answer,
                    None,
                )
            }
        };
        telemetry.record_generation(started.elapsed());

        sm.advance(TurnState::Done, None)?;
        let done = DoneData {
            provider,
            tier: provider_tier.to_string(),
            passages: passages.len(),
            elapsed_ms: sm.elapsed_ms(),
            fallbacks,
            verified,
        };
        sink.send(StreamEvent::done(&sink.correlation_id, &done))
            .await?;

        // Fire and forget: nothing past this point affects the turn.
        if let Some(queue) = &self.writes {
            let queued = queue
                .enqueue(MemoryWriteJob {
                    user_id: request.user_id.clone(),
                    user_message: request.question.clone(),
                    ai_response: answer,
                    correlation_id: sink.correlation_id.clone(),
                })
                .is_ok();
            telemetry.record_memory_write(queued);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_answer_roundtrips_text() {
        let text = "Il regime forfettario si applica ai ricavi fino a 85.000 euro.\nVedi [1].";
        let chunks = chunk_answer(text, 16);
        assert!(chunks.len() > 3);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            // A single long word may exceed the budget; nothing else does.
            assert!(c.chars().count() <= 16 || !c.trim().contains(' '));
        }
    }

    #[test]
    fn test_chunk_answer_empty() {
        assert!(chunk_answer("", 10).is_empty());
    }

    #[test]
    fn test_turn_error_types() {
        assert_eq!(
            TurnError::InvalidRequest("x".into()).error_type(),
            "invalid_request"
        );
        assert_eq!(
            TurnError::from(GatewayError::Cancelled).error_type(),
            "cancelled"
        );
        assert!(TurnError::from(GatewayError::Cancelled).is_cancellation());
        assert!(!TurnError::InvalidRequest("x".into()).is_cancellation());
    }

    #[test]
    fn test_request_builder() {
        let req = TurnRequest::new("u1", "q")
            .with_tier(Tier::Pro)
            .with_correlation_id("c-7");
        assert_eq!(req.tier, Some(Tier::Pro));
        assert_eq!(req.correlation_id.as_deref(), Some("c-7"));
        assert!(req.filters.is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.default_tier, Tier::Flash);
        assert!(!config.verify_answers);
        assert_eq!(config.max_error_chars, 240);
    }
}
