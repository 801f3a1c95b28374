//! Process wiring: one place that turns a [`RagConfig`] into running services.
//!
//! ```text
//! RagConfig ─▶ ProviderRegistry ─▶ LlmGateway ───────────────┐
//!          ├─▶ Postgres pool | in-process ─▶ MemoryOrchestrator ─┼─▶ AgenticOrchestrator
//!          └─▶ HashingEmbedder + BM25 ─▶ HybridSearchService ─┘
//! ```
//!
//! Memory initialisation failures are logged and leave the service in its
//! degraded or unavailable state; the app still starts.

use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::memory::{
    FactExtractor, InMemoryCollectiveMemory, InMemoryMemoryStore, LlmFactExtractor,
    PatternFactExtractor, SqlMemoryStore,
};
use coordination::search::{Bm25Scorer, HashingEmbedder, InMemoryVectorStore};
use coordination::{
    BackoffPolicy, HybridSearchService, LlmGateway, MemoryOrchestrator, MemoryStore, Tier,
};
use tracing::{info, warn};

use crate::config::{ExtractorKind, RagConfig};
use crate::memory_writer::{ConversationSink, MemoryWriteQueue, MemoryWriteWorker};
use crate::orchestrator::AgenticOrchestrator;
use crate::pg::{PostgresPool, DEFAULT_MAX_CONNECTIONS};
use crate::prompt::PromptBuilder;
use crate::status::StatusProbe;
use crate::verifier::{AnswerVerifier, CitationVerifier, LlmVerifier};

/// Running services. Drop `orchestrator` and `probe`, then await `writer`,
/// to flush pending memory writes on shutdown.
pub struct App {
    pub orchestrator: Arc<AgenticOrchestrator>,
    pub probe: StatusProbe,
    pub writer: MemoryWriteWorker,
}

impl App {
    /// Stop accepting turns and wait for queued memory writes.
    pub async fn shutdown(self) {
        let App {
            orchestrator,
            probe,
            writer,
        } = self;
        drop(probe);
        drop(orchestrator);
        writer.join().await;
    }
}

fn memory_store(config: &RagConfig) -> Result<Arc<dyn MemoryStore>> {
    match &config.memory.database_url {
        Some(url) => {
            let backoff = BackoffPolicy {
                max_attempts: config.memory.connect_attempts.max(1),
                ..BackoffPolicy::default()
            };
            let pool = PostgresPool::new(url, DEFAULT_MAX_CONNECTIONS, backoff)
                .context("Invalid memory database URL")?;
            info!("Memory store: postgres");
            Ok(Arc::new(SqlMemoryStore::new(Arc::new(pool))))
        }
        None => {
            info!("Memory store: in-process");
            Ok(Arc::new(InMemoryMemoryStore::new()))
        }
    }
}

fn fact_extractor(
    kind: ExtractorKind,
    gateway: &Arc<LlmGateway>,
) -> Option<Arc<dyn FactExtractor>> {
    match kind {
        ExtractorKind::Pattern => Some(Arc::new(PatternFactExtractor::new())),
        ExtractorKind::Llm => Some(Arc::new(
            LlmFactExtractor::new(Arc::clone(gateway)).with_tier(Tier::Lite),
        )),
        ExtractorKind::None => None,
    }
}

/// Build every service from `config`.
pub async fn build_app(config: &RagConfig) -> Result<App> {
    let registry = config
        .build_registry()
        .context("Failed to build provider registry")?;
    if registry.is_empty() {
        warn!("No LLM providers configured; every turn will fail");
    }
    let gateway = Arc::new(LlmGateway::new(registry, config.gateway.settings.clone()));

    let mut memory = MemoryOrchestrator::new(memory_store(config)?, config.memory.settings.clone())
        .with_collective(Arc::new(
            InMemoryCollectiveMemory::new(config.memory.collective_min_users)
                .with_capacity(config.memory.collective_capacity),
        ));
    if let Some(extractor) = fact_extractor(config.memory.extractor, &gateway) {
        memory = memory.with_extractor(extractor);
    }
    let memory = Arc::new(memory);
    match memory.initialize().await {
        Ok(status) => info!(%status, "Memory service initialised"),
        Err(e) => warn!(error = %e, "Memory service unavailable; turns continue without it"),
    }

    let search = Arc::new(
        HybridSearchService::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            config.search.clone(),
        )
        .with_lexical(Arc::new(Bm25Scorer::default())),
    );
    let lexical = search.initialize_lexical().await;
    info!(?lexical, "Search service ready");

    let orch_config = config.orchestrator.clone();
    let sink: Arc<dyn ConversationSink> = memory.clone();
    let (queue, writer) = MemoryWriteQueue::spawn(
        sink,
        orch_config.write_queue_capacity,
        orch_config.write_concurrency,
    );

    let mut orchestrator = AgenticOrchestrator::new(
        Arc::clone(&gateway),
        Arc::clone(&memory),
        Arc::clone(&search),
        orch_config.clone(),
    )
    .with_write_queue(queue.clone())
    .with_prompt_builder(PromptBuilder::new().with_history_window(orch_config.history_window));
    if orch_config.verify_answers {
        let verifier: Arc<dyn AnswerVerifier> = if gateway.registry().is_empty() {
            Arc::new(CitationVerifier)
        } else {
            Arc::new(LlmVerifier::new(Arc::clone(&gateway)))
        };
        info!(verifier = verifier.name(), "Answer verification enabled");
        orchestrator = orchestrator.with_verifier(verifier);
    }

    let endpoints = config
        .gateway
        .providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| (p.endpoint.name.clone(), p.endpoint.base_url.clone()))
        .collect();
    let probe = StatusProbe::new(memory, gateway, search)
        .with_write_queue(queue)
        .with_endpoints(endpoints);

    Ok(App {
        orchestrator: Arc::new(orchestrator),
        probe,
        writer,
    })
}
