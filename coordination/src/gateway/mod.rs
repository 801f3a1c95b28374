//! LLM Gateway: tiered model selection with circuit breakers and fallback.
//!
//! # Call path
//!
//! ```text
//! generate(tier, messages)
//!   → chain = registry.fallback_chain(tier)      requested tier, then lower tiers
//!   → for provider in chain:
//!       skip if unavailable / circuit open / max_fallback_depth reached
//!       timeout(provider.generate())
//!         ├─ Ok          → breaker.record_success, return
//!         ├─ Permanent   → abort chain, surface to caller
//!         └─ Transient / Unknown → breaker.record_failure, next provider
//!   → GatewayError::Exhausted { attempts }
//! ```
//!
//! `stream` selects a provider the same way, but only until the first chunk
//! has been produced. After that the provider is committed: a mid-stream
//! failure ends the stream with one [`GatewayError::StreamInterrupted`] item
//! instead of replaying the prompt somewhere else.
//!
//! Breaker and health state live behind short-lived `std::sync::Mutex`
//! guards that are never held across an `.await`.

pub mod circuit_breaker;
pub mod errors;
pub mod openai;
pub mod provider;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerState, CircuitState};
pub use errors::{AttemptOutcome, GatewayError, ProviderAttempt, SkipReason};
pub use openai::{OpenAiCompatConfig, OpenAiCompatProvider};
pub use provider::{
    ChatMessage, ChunkStream, GenerateOptions, LlmResponse, ProviderAdapter, ProviderError,
    ProviderErrorKind, Role, TokenUsage,
};
pub use registry::{
    CostTable, FallbackChain, ProviderHandle, ProviderHealth, ProviderRegistry,
    RegisteredProvider, Tier,
};

use crate::resilience::{duration_millis, ErrorCategory};

/// Gateway tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Consecutive failures before a provider's circuit opens.
    pub failure_threshold: u32,
    #[serde(rename = "cooldown_ms", with = "duration_millis")]
    pub cooldown: Duration,
    /// Per-provider timeout for `generate` and for opening a stream.
    #[serde(rename = "request_timeout_ms", with = "duration_millis")]
    pub request_timeout: Duration,
    /// Maximum silence between two stream chunks.
    #[serde(rename = "chunk_timeout_ms", with = "duration_millis")]
    pub chunk_timeout: Duration,
    /// Upper bound on provider calls per request, across all tiers.
    pub max_fallback_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            chunk_timeout: Duration::from_secs(30),
            max_fallback_depth: 4,
        }
    }
}

/// Successful `generate` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub provider: String,
    pub tier: Tier,
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
    /// Providers that failed or were skipped before this one answered.
    pub fallbacks: Vec<ProviderAttempt>,
}

/// Health snapshot for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub tier: Tier,
    pub available: bool,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub success_count: u64,
    pub error_count: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tier-based LLM gateway over a set of provider adapters.
pub struct LlmGateway {
    registry: ProviderRegistry,
    breaker: Arc<Mutex<CircuitBreaker>>,
    health: Arc<Mutex<HashMap<String, ProviderHealth>>>,
    config: GatewayConfig,
}

impl LlmGateway {
    pub fn new(registry: ProviderRegistry, config: GatewayConfig) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown);
        Self {
            registry,
            breaker: Arc::new(Mutex::new(breaker)),
            health: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Fallback chain for `tier` under current health data.
    pub fn fallback_chain(&self, tier: Tier) -> FallbackChain {
        let health = lock(&self.health).clone();
        self.registry.fallback_chain(tier, &health)
    }

    /// Breaker record for `provider`.
    pub fn circuit(&self, provider: &str) -> CircuitBreakerState {
        lock(&self.breaker).snapshot(provider)
    }

    /// Decide whether `entry` may be called now; `None` means go ahead.
    fn gate(&self, entry: &RegisteredProvider, calls_made: usize) -> Option<SkipReason> {
        if !entry.handle.available || !entry.adapter.is_available() {
            return Some(SkipReason::Unavailable);
        }
        if calls_made >= self.config.max_fallback_depth {
            return Some(SkipReason::DepthExceeded);
        }
        if !lock(&self.breaker).admit(&entry.handle.name).is_allowed() {
            return Some(SkipReason::CircuitOpen);
        }
        None
    }

    fn on_success(&self, provider: &str, latency_ms: u64) {
        lock(&self.breaker).record_success(provider);
        lock(&self.health)
            .entry(provider.to_string())
            .or_default()
            .record_success(latency_ms);
    }

    fn on_failure(&self, provider: &str, error: &ProviderError) {
        let category = error.category();
        if category == ErrorCategory::Permanent {
            // The request was at fault, not the provider.
            lock(&self.breaker).abandon_probe(provider);
        } else {
            lock(&self.breaker).record_failure(provider);
        }
        lock(&self.health)
            .entry(provider.to_string())
            .or_default()
            .record_failure();
    }

    /// Generate a complete response, falling back across providers.
    pub async fn generate(
        &self,
        tier: Tier,
        messages: &[ChatMessage],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let chain = self.fallback_chain(tier);
        if chain.is_empty() {
            return Err(GatewayError::NoProviders(tier));
        }
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let mut attempts = Vec::new();
        let mut calls_made = 0;

        for entry in &chain.providers {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let name = entry.handle.name.as_str();
            if let Some(reason) = self.gate(entry, calls_made) {
                debug!(provider = name, %tier, ?reason, "skipping provider");
                attempts.push(ProviderAttempt::skipped(name, reason));
                continue;
            }
            calls_made += 1;

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(timeout, entry.adapter.generate(messages, options)) => Some(r),
            };
            let Some(outcome) = outcome else {
                lock(&self.breaker).abandon_probe(name);
                info!(provider = name, "generate cancelled by caller");
                return Err(GatewayError::Cancelled);
            };
            let result = outcome.unwrap_or_else(|_| {
                Err(ProviderError::timeout(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                )))
            });

            match result {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.on_success(name, latency_ms);
                    info!(
                        provider = name,
                        %tier,
                        served_tier = %entry.handle.tier,
                        latency_ms,
                        fallbacks = attempts.len(),
                        "generate succeeded"
                    );
                    return Ok(GatewayResponse {
                        provider: name.to_string(),
                        tier: entry.handle.tier,
                        content: response.content,
                        model: response.model,
                        usage: response.usage,
                        latency_ms,
                        fallbacks: attempts,
                    });
                }
                Err(error) => {
                    self.on_failure(name, &error);
                    attempts.push(ProviderAttempt::failed(name, &error));
                    if error.category() == ErrorCategory::Permanent {
                        warn!(provider = name, error = %error, "permanent provider error, aborting chain");
                        return Err(GatewayError::Aborted {
                            provider: name.to_string(),
                            error,
                            attempts,
                        });
                    }
                    warn!(
                        provider = name,
                        category = %error.category(),
                        error = %error,
                        "provider failed, trying next"
                    );
                }
            }
        }

        warn!(%tier, tried = attempts.len(), "fallback chain exhausted");
        Err(GatewayError::Exhausted { tier, attempts })
    }

    /// Stream a response, falling back only until the first chunk arrives.
    pub async fn stream(
        &self,
        tier: Tier,
        messages: &[ChatMessage],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GatewayStream, GatewayError> {
        let chain = self.fallback_chain(tier);
        if chain.is_empty() {
            return Err(GatewayError::NoProviders(tier));
        }
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let mut attempts = Vec::new();
        let mut calls_made = 0;

        for entry in &chain.providers {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let name = entry.handle.name.as_str();
            if let Some(reason) = self.gate(entry, calls_made) {
                debug!(provider = name, %tier, ?reason, "skipping provider");
                attempts.push(ProviderAttempt::skipped(name, reason));
                continue;
            }
            calls_made += 1;
            let started = Instant::now();

            // Open the stream and wait for the first chunk; nothing has been
            // emitted yet, so any failure here is still safe to fall back from.
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(timeout, open_first_chunk(entry.adapter.as_ref(), messages, options)) => Some(r),
            };
            let Some(opened) = opened else {
                lock(&self.breaker).abandon_probe(name);
                return Err(GatewayError::Cancelled);
            };
            let opened = opened.unwrap_or_else(|_| {
                Err(ProviderError::timeout(format!(
                    "no first chunk within {}ms",
                    timeout.as_millis()
                )))
            });

            match opened {
                Ok((inner, first)) => {
                    info!(
                        provider = name,
                        %tier,
                        first_chunk_ms = started.elapsed().as_millis() as u64,
                        fallbacks = attempts.len(),
                        "stream opened"
                    );
                    let tail = StreamTail {
                        inner,
                        pending_first: first,
                        provider: name.to_string(),
                        breaker: Arc::clone(&self.breaker),
                        health: Arc::clone(&self.health),
                        chunk_timeout: self.config.chunk_timeout,
                        cancel: cancel.clone(),
                        started,
                        finished: false,
                    };
                    return Ok(GatewayStream {
                        provider: name.to_string(),
                        tier: entry.handle.tier,
                        fallbacks: attempts,
                        inner: Box::pin(tail.into_stream()),
                    });
                }
                Err(error) => {
                    self.on_failure(name, &error);
                    attempts.push(ProviderAttempt::failed(name, &error));
                    if error.category() == ErrorCategory::Permanent {
                        warn!(provider = name, error = %error, "permanent provider error, aborting chain");
                        return Err(GatewayError::Aborted {
                            provider: name.to_string(),
                            error,
                            attempts,
                        });
                    }
                    warn!(provider = name, error = %error, "stream failed before output, trying next");
                }
            }
        }

        warn!(%tier, tried = attempts.len(), "fallback chain exhausted");
        Err(GatewayError::Exhausted { tier, attempts })
    }

    /// Per-provider health for observability. Does not touch breaker state.
    pub fn health(&self) -> BTreeMap<String, ProviderStatus> {
        let breaker = lock(&self.breaker);
        let health = lock(&self.health);
        self.registry
            .handles()
            .map(|handle| {
                let h = health.get(&handle.name).cloned().unwrap_or_default();
                let status = ProviderStatus {
                    tier: handle.tier,
                    available: handle.available && breaker.is_available(&handle.name),
                    circuit: breaker.state(&handle.name),
                    consecutive_failures: breaker.failure_count(&handle.name),
                    avg_latency_ms: h.avg_latency_ms,
                    success_count: h.success_count,
                    error_count: h.error_count,
                };
                (handle.name.clone(), status)
            })
            .collect()
    }
}

async fn open_first_chunk(
    adapter: &dyn ProviderAdapter,
    messages: &[ChatMessage],
    options: &GenerateOptions,
) -> Result<(ChunkStream, Option<String>), ProviderError> {
    let mut inner = adapter.stream(messages, options).await?;
    match inner.next().await {
        Some(Ok(chunk)) => Ok((inner, Some(chunk))),
        Some(Err(e)) => Err(e),
        None => Ok((inner, None)),
    }
}

/// Stream state after a provider has been committed to.
struct StreamTail {
    inner: ChunkStream,
    pending_first: Option<String>,
    provider: String,
    breaker: Arc<Mutex<CircuitBreaker>>,
    health: Arc<Mutex<HashMap<String, ProviderHealth>>>,
    chunk_timeout: Duration,
    cancel: CancellationToken,
    started: Instant,
    finished: bool,
}

impl StreamTail {
    fn complete(&mut self) {
        self.finished = true;
        let latency_ms = self.started.elapsed().as_millis() as u64;
        lock(&self.breaker).record_success(&self.provider);
        lock(&self.health)
            .entry(self.provider.clone())
            .or_default()
            .record_success(latency_ms);
        debug!(provider = %self.provider, latency_ms, "stream completed");
    }

    fn interrupt(&mut self, category: ErrorCategory, message: String) -> GatewayError {
        self.finished = true;
        if category == ErrorCategory::Permanent {
            lock(&self.breaker).abandon_probe(&self.provider);
        } else {
            lock(&self.breaker).record_failure(&self.provider);
        }
        lock(&self.health)
            .entry(self.provider.clone())
            .or_default()
            .record_failure();
        warn!(provider = %self.provider, %category, error = %message, "stream interrupted mid-output");
        GatewayError::StreamInterrupted {
            provider: self.provider.clone(),
            category,
            message,
        }
    }

    fn into_stream(self) -> impl Stream<Item = Result<String, GatewayError>> + Send {
        futures::stream::unfold(self, |mut tail| async move {
            if tail.finished {
                return None;
            }
            if let Some(first) = tail.pending_first.take() {
                return Some((Ok(first), tail));
            }
            let next = tokio::select! {
                biased;
                _ = tail.cancel.cancelled() => None,
                n = tokio::time::timeout(tail.chunk_timeout, tail.inner.next()) => Some(n),
            };
            match next {
                None => {
                    tail.finished = true;
                    lock(&tail.breaker).abandon_probe(&tail.provider);
                    Some((Err(GatewayError::Cancelled), tail))
                }
                Some(Ok(Some(Ok(chunk)))) => Some((Ok(chunk), tail)),
                Some(Ok(None)) => {
                    tail.complete();
                    None
                }
                Some(Ok(Some(Err(error)))) => {
                    let err = tail.interrupt(error.category(), error.to_string());
                    Some((Err(err), tail))
                }
                Some(Err(_)) => {
                    let message = format!("no chunk within {}ms", tail.chunk_timeout.as_millis());
                    let err = tail.interrupt(ErrorCategory::Transient, message);
                    Some((Err(err), tail))
                }
            }
        })
    }
}

/// Chunk stream from the provider that won selection.
///
/// Yields text deltas; a failure after the first chunk is delivered as a
/// single `Err` item and the stream ends.
pub struct GatewayStream {
    pub provider: String,
    pub tier: Tier,
    pub fallbacks: Vec<ProviderAttempt>,
    inner: Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>,
}

impl std::fmt::Debug for GatewayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayStream")
            .field("provider", &self.provider)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl Stream for GatewayStream {
    type Item = Result<String, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    enum Script {
        Answer(&'static str),
        Fail(ProviderError),
        Hang,
        Chunks(Vec<&'static str>),
        ChunksThenFail(Vec<&'static str>, ProviderError),
    }

    struct Scripted {
        name: String,
        script: Script,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerateOptions,
        ) -> Result<LlmResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Answer(text) => Ok(LlmResponse::new(*text, format!("{}-model", self.name))),
                Script::Fail(e) => Err(e.clone()),
                Script::Hang => futures::future::pending().await,
                Script::Chunks(chunks) => Ok(LlmResponse::new(chunks.concat(), "m")),
                Script::ChunksThenFail(_, e) => Err(e.clone()),
            }
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerateOptions,
        ) -> Result<ChunkStream, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<String, ProviderError>> = match &self.script {
                Script::Answer(text) => vec![Ok(text.to_string())],
                Script::Fail(e) => return Err(e.clone()),
                Script::Hang => {
                    return Ok(Box::pin(futures::stream::pending()));
                }
                Script::Chunks(chunks) => chunks.iter().map(|c| Ok(c.to_string())).collect(),
                Script::ChunksThenFail(chunks, e) => chunks
                    .iter()
                    .map(|c| Ok(c.to_string()))
                    .chain(std::iter::once(Err(e.clone())))
                    .collect(),
            };
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::new(ProviderErrorKind::Unavailable, "503 upstream")
    }

    fn gateway(providers: Vec<(Arc<Scripted>, Tier)>, config: GatewayConfig) -> LlmGateway {
        let mut registry = ProviderRegistry::new();
        for (p, tier) in providers {
            let handle = ProviderHandle::new(p.name.clone(), tier);
            registry.register(handle, p);
        }
        LlmGateway::new(registry, config)
    }

    fn ask() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hi")]
    }

    #[tokio::test]
    async fn test_falls_back_to_third_provider() {
        let a = Scripted::new("a", Script::Fail(unavailable()));
        let b = Scripted::new("b", Script::Fail(ProviderError::timeout("slow")));
        let c = Scripted::new("c", Script::Answer("from c"));
        let gw = gateway(
            vec![(a.clone(), Tier::Flash), (b.clone(), Tier::Flash), (c.clone(), Tier::Flash)],
            GatewayConfig::default(),
        );

        let resp = gw
            .generate(Tier::Flash, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "c");
        assert_eq!(resp.content, "from c");
        assert_eq!(resp.fallbacks.len(), 2);
        assert_eq!(gw.circuit("a").consecutive_failures, 1);
        assert_eq!(gw.circuit("b").consecutive_failures, 1);
        assert_eq!(gw.circuit("c").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_chain() {
        let a = Scripted::new("a", Script::Fail(ProviderError::invalid_request("bad schema")));
        let b = Scripted::new("b", Script::Answer("never"));
        let gw = gateway(
            vec![(a.clone(), Tier::Pro), (b.clone(), Tier::Pro)],
            GatewayConfig::default(),
        );

        let err = gw
            .generate(Tier::Pro, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Aborted { ref provider, .. } if provider == "a"));
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert_eq!(b.calls(), 0);
        // Request errors do not count against the provider.
        assert_eq!(gw.circuit("a").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_reports_every_attempt() {
        let a = Scripted::new("a", Script::Fail(unavailable()));
        let b = Scripted::new("b", Script::Fail(ProviderError::other("mystery")));
        let gw = gateway(
            vec![(a, Tier::Lite), (b, Tier::Fallback)],
            GatewayConfig::default(),
        );

        let err = gw
            .generate(Tier::Lite, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "provider_exhausted");
        let names: Vec<&str> = err.attempts().iter().map(|a| a.provider.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(err.attempts().iter().all(ProviderAttempt::was_called));
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped() {
        let a = Scripted::new("a", Script::Fail(unavailable()));
        let b = Scripted::new("b", Script::Answer("ok"));
        let config = GatewayConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(600),
            ..GatewayConfig::default()
        };
        let gw = gateway(vec![(a.clone(), Tier::Flash), (b, Tier::Flash)], config);
        let cancel = CancellationToken::new();

        gw.generate(Tier::Flash, &ask(), &GenerateOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(gw.circuit("a").state, CircuitState::Open);

        let resp = gw
            .generate(Tier::Flash, &ask(), &GenerateOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(
            resp.fallbacks[0].outcome,
            AttemptOutcome::Skipped {
                reason: SkipReason::CircuitOpen
            }
        );
    }

    #[tokio::test]
    async fn test_max_fallback_depth_bounds_calls() {
        let providers: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| (Scripted::new(n, Script::Fail(ProviderError::other("??"))), Tier::Flash))
            .collect();
        let all: Vec<Arc<Scripted>> = providers.iter().map(|(p, _)| p.clone()).collect();
        let config = GatewayConfig {
            max_fallback_depth: 2,
            ..GatewayConfig::default()
        };
        let gw = gateway(providers, config);

        let err = gw
            .generate(Tier::Flash, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        let total: u32 = all.iter().map(|p| p.calls()).sum();
        assert_eq!(total, 2);
        assert_eq!(err.attempts().iter().filter(|a| a.was_called()).count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_handle_is_skipped() {
        let a = Scripted::new("a", Script::Answer("a"));
        let b = Scripted::new("b", Script::Answer("b"));
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderHandle::new("a", Tier::Pro).unavailable(), a.clone());
        registry.register(ProviderHandle::new("b", Tier::Pro), b);
        let gw = LlmGateway::new(registry, GatewayConfig::default());

        let resp = gw
            .generate(Tier::Pro, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_providers_for_tier() {
        let a = Scripted::new("a", Script::Answer("a"));
        let gw = gateway(vec![(a, Tier::Lite)], GatewayConfig::default());
        let err = gw
            .generate(Tier::Fallback, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoProviders(Tier::Fallback)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient_failure() {
        let a = Scripted::new("a", Script::Hang);
        let b = Scripted::new("b", Script::Answer("b"));
        let config = GatewayConfig {
            request_timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        };
        let gw = gateway(vec![(a, Tier::Flash), (b, Tier::Flash)], config);

        let resp = gw
            .generate(Tier::Flash, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert_eq!(gw.circuit("a").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_generate() {
        let a = Scripted::new("a", Script::Hang);
        let gw = gateway(vec![(a, Tier::Flash)], GatewayConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = gw
            .generate(Tier::Flash, &ask(), &GenerateOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(gw.circuit("a").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_stream_falls_back_before_first_chunk() {
        let a = Scripted::new("a", Script::Fail(unavailable()));
        let b = Scripted::new("b", Script::Chunks(vec!["Hel", "lo"]));
        let gw = gateway(vec![(a, Tier::Flash), (b, Tier::Flash)], GatewayConfig::default());

        let stream = gw
            .stream(Tier::Flash, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.provider, "b");
        let chunks: Vec<_> = stream.collect().await;
        let text: String = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(text, "Hello");
        assert_eq!(gw.health()["b"].success_count, 1);
    }

    #[tokio::test]
    async fn test_stream_failure_after_output_is_not_replayed() {
        let a = Scripted::new("a", Script::ChunksThenFail(vec!["par"], unavailable()));
        let b = Scripted::new("b", Script::Chunks(vec!["never"]));
        let gw = gateway(
            vec![(a.clone(), Tier::Flash), (b.clone(), Tier::Flash)],
            GatewayConfig::default(),
        );

        let stream = gw
            .stream(Tier::Flash, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "par");
        assert!(matches!(
            items[1],
            Err(GatewayError::StreamInterrupted { ref provider, .. }) if provider == "a"
        ));
        assert_eq!(b.calls(), 0);
        assert_eq!(gw.circuit("a").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_health_reports_every_provider() {
        let a = Scripted::new("a", Script::Answer("a"));
        let b = Scripted::new("b", Script::Answer("b"));
        let gw = gateway(vec![(a, Tier::Pro), (b, Tier::Lite)], GatewayConfig::default());
        gw.generate(Tier::Pro, &ask(), &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let health = gw.health();
        assert_eq!(health.len(), 2);
        assert_eq!(health["a"].success_count, 1);
        assert_eq!(health["a"].circuit, CircuitState::Closed);
        assert_eq!(health["b"].tier, Tier::Lite);
        assert!(health["b"].available);
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let json = serde_json::to_value(GatewayConfig::default()).unwrap();
        assert_eq!(json["cooldown_ms"], 60_000);
        assert_eq!(json["max_fallback_depth"], 4);
        let parsed: GatewayConfig =
            serde_json::from_str(r#"{"failure_threshold": 5, "chunk_timeout_ms": 100}"#).unwrap();
        assert_eq!(parsed.failure_threshold, 5);
        assert_eq!(parsed.chunk_timeout, Duration::from_millis(100));
        assert_eq!(parsed.request_timeout, Duration::from_secs(60));
    }
}
