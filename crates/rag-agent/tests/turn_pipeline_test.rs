//! End-to-end turn tests over scripted providers.
//!
//! Every test wires real gateway, memory and search services; only the LLM
//! providers (and, where noted, the memory store) are fakes. No network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::gateway::{
    ChatMessage, ChunkStream, GenerateOptions, LlmResponse, ProviderAdapter, ProviderError,
    ProviderHandle, ProviderRegistry, Tier,
};
use coordination::memory::{
    InMemoryCollectiveMemory, InMemoryMemoryStore, MemoryContext, MemoryError, MemoryStore,
    MemoryUpdate, PatternFactExtractor,
};
use coordination::search::{Bm25Scorer, Document, HashingEmbedder, InMemoryVectorStore};
use coordination::{
    ErrorCategory, GatewayConfig, HybridSearchService, LlmGateway, MemoryConfig,
    MemoryOrchestrator, SearchConfig,
};
use futures::StreamExt;
use mockall::mock;
use rag_agent::events::EventType;
use rag_agent::memory_writer::MemoryWriteQueue;
use rag_agent::verifier::CitationVerifier;
use rag_agent::{AgenticOrchestrator, OrchestratorConfig, StreamEvent, TurnOutcome, TurnRequest};
use tokio::sync::mpsc;

// ── Scripted provider ────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Script {
    /// Answer with the configured chunks.
    Answer,
    /// Every call fails with HTTP 503.
    Down,
    /// First chunk immediately, then stall.
    Stall,
    /// First chunk, then the connection drops.
    Break,
}

struct ScriptedProvider {
    name: String,
    script: Script,
    chunks: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &str, script: Script, chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<LlmResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Down => Err(ProviderError::from_status(503, "overloaded")),
            _ => Ok(LlmResponse::new(self.chunks.concat(), "scripted")),
        }
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<ChunkStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Down => Err(ProviderError::from_status(503, "overloaded")),
            Script::Answer => Ok(Box::pin(futures::stream::iter(
                self.chunks.clone().into_iter().map(Ok),
            ))),
            Script::Stall => {
                let first = self.chunks.first().cloned().unwrap_or_default();
                let rest = futures::stream::iter(0..).then(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, ProviderError>("late".to_string())
                });
                Ok(Box::pin(futures::stream::once(async move { Ok(first) }).chain(rest)))
            }
            Script::Break => Ok(Box::pin(futures::stream::iter(vec![
                Ok(self.chunks.concat()),
                Err(ProviderError::from_status(502, "upstream reset")),
            ]))),
        }
    }
}

// ── Memory store that never connects ────────────────────────────────────────

mock! {
    pub Store {}

    #[async_trait]
    impl MemoryStore for Store {
        async fn connect(&self) -> Result<(), MemoryError>;
        async fn load_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError>;
        async fn apply_update(&self, user_id: &str, update: MemoryUpdate) -> Result<usize, MemoryError>;
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────────

fn gateway(providers: &[Arc<ScriptedProvider>]) -> Arc<LlmGateway> {
    let mut registry = ProviderRegistry::new();
    for (i, p) in providers.iter().enumerate() {
        registry.register(
            ProviderHandle::new(p.name.clone(), Tier::Flash).with_priority(i as u32),
            p.clone(),
        );
    }
    Arc::new(LlmGateway::new(registry, GatewayConfig::default()))
}

async fn memory_with(store: Arc<dyn MemoryStore>) -> Arc<MemoryOrchestrator> {
    let memory = MemoryOrchestrator::new(store, MemoryConfig::default())
        .with_extractor(Arc::new(PatternFactExtractor::new()))
        .with_collective(Arc::new(InMemoryCollectiveMemory::new(2)));
    let _ = memory.initialize().await;
    Arc::new(memory)
}

async fn search() -> Arc<HybridSearchService> {
    let search = HybridSearchService::new(
        Arc::new(HashingEmbedder::default()),
        Arc::new(InMemoryVectorStore::new()),
        SearchConfig::default(),
    )
    .with_lexical(Arc::new(Bm25Scorer::default()));
    search
        .index_documents(&[
            Document {
                id: "flat-tax".into(),
                text: "The flat-rate scheme applies to revenue up to 85,000 euro.".into(),
                metadata: Default::default(),
            },
            Document {
                id: "vat".into(),
                text: "Businesses under the flat-rate scheme do not charge VAT.".into(),
                metadata: Default::default(),
            },
        ])
        .await
        .unwrap();
    search.initialize_lexical().await;
    Arc::new(search)
}

async fn orchestrator(
    providers: &[Arc<ScriptedProvider>],
    config: OrchestratorConfig,
) -> Arc<AgenticOrchestrator> {
    let memory = memory_with(Arc::new(InMemoryMemoryStore::new())).await;
    Arc::new(AgenticOrchestrator::new(
        gateway(providers),
        memory,
        search().await,
        config,
    ))
}

async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn stages(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::Status)
        .filter_map(|e| e.data.get("stage").and_then(|s| s.as_str()).map(String::from))
        .collect()
}

fn answer(events: &[StreamEvent]) -> String {
    events.iter().filter_map(StreamEvent::token_text).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_turn_streams_tokens_then_done() {
    let primary = ScriptedProvider::new("primary", Script::Answer, &["The flat-rate ", "scheme [1]."]);
    let orch = orchestrator(&[primary.clone()], OrchestratorConfig::default()).await;

    let (rx, handle) = orch.spawn_turn(
        TurnRequest::new("alice", "Which revenue limit applies to the flat-rate scheme?")
            .with_correlation_id("turn-1"),
    );
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    assert_eq!(
        stages(&events),
        vec!["received", "context_loaded", "retrieved", "generating"]
    );
    assert_eq!(answer(&events), "The flat-rate scheme [1].");
    assert!(events.iter().all(|e| e.correlation_id == "turn-1"));

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Done);
    let done = last.done_data().unwrap();
    assert_eq!(done.provider, "primary");
    assert_eq!(done.tier, "flash");
    assert_eq!(done.fallbacks, 0);
    assert!(done.passages > 0);
    assert_eq!(done.verified, None);
    // Exactly one terminal event, and it is last.
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    assert_eq!(record.outcome, TurnOutcome::Done);
    assert_eq!(record.tokens_streamed, 2);
    assert!(record.memory_loaded);
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn test_fallback_provider_answers_when_primary_is_down() {
    let primary = ScriptedProvider::new("primary", Script::Down, &[]);
    let backup = ScriptedProvider::new("backup", Script::Answer, &["from backup"]);
    let orch = orchestrator(&[primary.clone(), backup.clone()], OrchestratorConfig::default()).await;

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "Any question?"));
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    let done = events.last().and_then(StreamEvent::done_data).unwrap();
    assert_eq!(done.provider, "backup");
    assert_eq!(done.fallbacks, 1);
    assert_eq!(answer(&events), "from backup");
    assert_eq!(record.fallbacks, 1);
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_chain_is_fatal_and_never_done() {
    let a = ScriptedProvider::new("a", Script::Down, &[]);
    let b = ScriptedProvider::new("b", Script::Down, &[]);
    let orch = orchestrator(&[a, b], OrchestratorConfig::default()).await;

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "Will this work?"));
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    assert!(events.iter().all(|e| e.event_type != EventType::Done));
    let last = events.last().unwrap();
    let err = last.error_data().unwrap();
    assert!(err.fatal);
    assert_eq!(err.error_type, "provider_exhausted");
    assert_eq!(record.outcome, TurnOutcome::Error);
    assert_eq!(record.error_type.as_deref(), Some("provider_exhausted"));
}

#[tokio::test]
async fn test_mid_stream_failure_is_fatal_and_not_replayed() {
    let broken = ScriptedProvider::new("broken", Script::Break, &["partial answer"]);
    let backup = ScriptedProvider::new("backup", Script::Answer, &["full answer"]);
    let orch = orchestrator(&[broken, backup.clone()], OrchestratorConfig::default()).await;

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "Explain the scheme"));
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    assert_eq!(answer(&events), "partial answer");
    let err = events.last().and_then(StreamEvent::error_data).unwrap();
    assert!(err.fatal);
    assert_eq!(err.error_type, "stream_interrupted");
    assert!(events.iter().all(|e| e.event_type != EventType::Done));
    assert_eq!(backup.calls(), 0);
    assert_eq!(record.outcome, TurnOutcome::Error);
    assert!(!record.memory_write_queued);
}

#[tokio::test]
async fn test_empty_question_is_rejected() {
    let p = ScriptedProvider::new("p", Script::Answer, &["x"]);
    let orch = orchestrator(&[p.clone()], OrchestratorConfig::default()).await;

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "   "));
    let events = collect(rx).await;

    assert_eq!(events.len(), 1);
    let err = events[0].error_data().unwrap();
    assert!(err.fatal);
    assert_eq!(err.error_type, "invalid_request");
    assert_eq!(handle.await.unwrap().outcome, TurnOutcome::Error);
    assert_eq!(p.calls(), 0);
}

#[tokio::test]
async fn test_memory_outage_is_a_warning_not_a_failure() {
    let mut store = MockStore::new();
    store.expect_connect().returning(|| {
        Err(MemoryError::StoreConnect {
            message: "connection refused by postgres://rag:hunter2@db:5432/rag".into(),
            category: ErrorCategory::Transient,
        })
    });
    store.expect_load_context().never();
    let memory = memory_with(Arc::new(store)).await;

    let p = ScriptedProvider::new("p", Script::Answer, &["answer without memory"]);
    let orch = Arc::new(AgenticOrchestrator::new(
        gateway(&[p]),
        memory,
        search().await,
        OrchestratorConfig::default(),
    ));

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "What do you know about me?"));
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    let warning = events
        .iter()
        .filter_map(StreamEvent::error_data)
        .find(|e| e.error_type == "memory_unavailable")
        .unwrap();
    assert!(!warning.fatal);
    // Connection details never reach the client.
    assert!(!warning.message.contains("hunter2"));
    assert!(!warning.message.contains("postgres://"));

    assert_eq!(events.last().unwrap().event_type, EventType::Done);
    assert_eq!(answer(&events), "answer without memory");
    assert_eq!(record.outcome, TurnOutcome::Done);
    assert!(!record.memory_loaded);
    assert_eq!(record.warnings, 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_cancels_turn() {
    let p = ScriptedProvider::new("p", Script::Stall, &["first "]);
    let orch = orchestrator(&[p], OrchestratorConfig::default()).await;

    let (mut rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "Tell me a long story"));
    loop {
        let event = rx.recv().await.unwrap();
        if event.event_type == EventType::Token {
            break;
        }
    }
    drop(rx);

    let record = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, TurnOutcome::Cancelled);
    assert!(!record.memory_write_queued);
}

#[tokio::test]
async fn test_verification_failure_still_delivers_answer() {
    let p = ScriptedProvider::new(
        "p",
        Script::Answer,
        &["The limit is 85,000 euro [1], see also [9]."],
    );
    let config = OrchestratorConfig {
        verify_answers: true,
        replay_chunk_chars: 10,
        ..OrchestratorConfig::default()
    };
    let memory = memory_with(Arc::new(InMemoryMemoryStore::new())).await;
    let orch = Arc::new(
        AgenticOrchestrator::new(gateway(&[p]), memory, search().await, config)
            .with_verifier(Arc::new(CitationVerifier)),
    );

    let (rx, handle) = orch.spawn_turn(TurnRequest::new("alice", "What is the revenue limit?"));
    let events = collect(rx).await;
    let record = handle.await.unwrap();

    assert!(stages(&events).contains(&"verifying".to_string()));
    let warning = events
        .iter()
        .filter_map(StreamEvent::error_data)
        .find(|e| e.error_type == "verification_failed")
        .unwrap();
    assert!(!warning.fatal);
    assert!(warning.message.contains("[9]"));

    assert_eq!(answer(&events), "The limit is 85,000 euro [1], see also [9].");
    assert!(events.iter().filter(|e| e.event_type == EventType::Token).count() > 1);
    let done = events.last().and_then(StreamEvent::done_data).unwrap();
    assert_eq!(done.verified, Some(false));
    assert_eq!(record.verified, Some(false));
}

#[tokio::test]
async fn test_finished_turn_is_remembered() {
    let memory = memory_with(Arc::new(InMemoryMemoryStore::new())).await;
    let (queue, worker) = MemoryWriteQueue::spawn(memory.clone(), 8, 2);
    let p = ScriptedProvider::new("p", Script::Answer, &["Then the flat-rate scheme fits."]);
    let orch = Arc::new(
        AgenticOrchestrator::new(
            gateway(&[p]),
            memory.clone(),
            search().await,
            OrchestratorConfig::default(),
        )
        .with_write_queue(queue),
    );

    let (rx, handle) = orch.spawn_turn(TurnRequest::new(
        "alice",
        "I run a bakery in Turin. Which tax scheme fits?",
    ));
    let events = collect(rx).await;
    let record = handle.await.unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Done);
    assert!(record.memory_write_queued);

    // Dropping the last queue handle lets the worker drain and stop.
    drop(orch);
    tokio::time::timeout(Duration::from_secs(5), worker.join())
        .await
        .unwrap();

    let ctx = memory.get_user_context("alice").await.unwrap();
    assert_eq!(ctx.profile_facts, vec!["I run a bakery in Turin".to_string()]);
    assert_eq!(ctx.counters.get("conversations"), Some(&1));
}
