//! Memory Orchestrator: concurrency-safe façade over store, extractor, and
//! collective memory.
//!
//! # Lifecycle
//!
//! ```text
//! initialize()
//!   store.connect()          ── Err ──▶ UNAVAILABLE (terminal, error kept)
//!   extractor.initialize()   ── Err ──▶ DEGRADED
//!   collective.initialize()  ── Err ──▶ DEGRADED
//!   all Ok                   ─────────▶ HEALTHY
//! ```
//!
//! Reads pass through a semaphore (queue, never fail, when saturated).
//! Writes take the user's own lock from [`UserLockRegistry`] with a bounded
//! wait; on timeout the write is dropped and an empty result returned.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::collective::{CollectiveInsight, CollectiveMemory};
use super::errors::MemoryError;
use super::extractor::{Extraction, FactExtractor};
use super::locks::UserLockRegistry;
use super::store::{FactPolicy, MemoryContext, MemoryStore, MemoryUpdate};
use crate::resilience::{duration_millis, ErrorCategory, ServiceStatus};

/// Status of the memory service as seen by callers.
pub type OrchestratorServiceStatus = ServiceStatus;

/// Memory orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Simultaneous `get_user_context` calls; the rest queue.
    pub read_concurrency: usize,
    #[serde(rename = "write_lock_timeout_ms", with = "duration_millis")]
    pub write_lock_timeout: Duration,
    /// Timeout for each store call.
    #[serde(rename = "store_timeout_ms", with = "duration_millis")]
    pub store_timeout: Duration,
    /// Maximum idle per-user locks kept in memory.
    pub lock_capacity: usize,
    pub fact_policy: FactPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 10,
            write_lock_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(10),
            lock_capacity: UserLockRegistry::DEFAULT_CAPACITY,
            fact_policy: FactPolicy::default(),
        }
    }
}

/// Outcome of one `process_conversation` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProcessResult {
    pub facts_extracted: usize,
    pub facts_saved: usize,
    pub processing_time_ms: u64,
    pub success: bool,
}

impl MemoryProcessResult {
    fn skipped(started: Instant) -> Self {
        Self {
            facts_extracted: 0,
            facts_saved: 0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            success: false,
        }
    }
}

/// Component-level health detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub status: ServiceStatus,
    pub initialized: bool,
    pub extractor_ready: bool,
    pub collective_ready: bool,
    pub tracked_user_locks: usize,
    pub read_permits_available: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    status: Option<ServiceStatus>,
    init_error: Option<MemoryError>,
    extractor_ready: bool,
    collective_ready: bool,
}

/// Per-user serialised memory reads and writes.
pub struct MemoryOrchestrator {
    store: Arc<dyn MemoryStore>,
    extractor: Option<Arc<dyn FactExtractor>>,
    collective: Option<Arc<dyn CollectiveMemory>>,
    config: MemoryConfig,
    read_limiter: Semaphore,
    locks: UserLockRegistry,
    lifecycle: RwLock<Lifecycle>,
    init_guard: Mutex<()>,
}

impl MemoryOrchestrator {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            extractor: None,
            collective: None,
            read_limiter: Semaphore::new(config.read_concurrency.max(1)),
            locks: UserLockRegistry::new(config.lock_capacity),
            lifecycle: RwLock::new(Lifecycle::default()),
            init_guard: Mutex::new(()),
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_collective(mut self, collective: Arc<dyn CollectiveMemory>) -> Self {
        self.collective = Some(collective);
        self
    }

    fn read_lifecycle<R>(&self, f: impl FnOnce(&Lifecycle) -> R) -> R {
        f(&self.lifecycle.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_lifecycle(&self, f: impl FnOnce(&mut Lifecycle)) {
        f(&mut self.lifecycle.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Connect the store and bring up optional sub-services.
    ///
    /// Idempotent once it has succeeded. After a store failure every later
    /// call returns that same error without retrying the connection.
    pub async fn initialize(&self) -> Result<ServiceStatus, MemoryError> {
        let _guard = self.init_guard.lock().await;
        let (status, stored_error) =
            self.read_lifecycle(|l| (l.status, l.init_error.clone()));
        if let Some(err) = stored_error {
            return Err(err);
        }
        if let Some(status) = status {
            return Ok(status);
        }

        let connected = match tokio::time::timeout(self.config.store_timeout, self.store.connect())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(MemoryError::StoreConnect {
                message: "store connection timed out".to_string(),
                category: ErrorCategory::Transient,
            }),
        };
        if let Err(err) = connected {
            error!(error = %err, "memory store connection failed, service unavailable");
            self.write_lifecycle(|l| {
                l.status = Some(ServiceStatus::Unavailable);
                l.init_error = Some(err.clone());
            });
            return Err(err);
        }

        let extractor_ready = match &self.extractor {
            None => {
                warn!("no fact extractor configured");
                false
            }
            Some(ex) => match ex.initialize().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(extractor = ex.name(), error = %e, "fact extractor unavailable");
                    false
                }
            },
        };
        let collective_ready = match &self.collective {
            None => false,
            Some(c) => match c.initialize().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "collective memory unavailable");
                    false
                }
            },
        };

        let status = if extractor_ready && (collective_ready || self.collective.is_none()) {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Degraded
        };
        self.write_lifecycle(|l| {
            l.status = Some(status);
            l.extractor_ready = extractor_ready;
            l.collective_ready = collective_ready;
        });
        info!(%status, extractor_ready, collective_ready, "memory orchestrator initialized");
        Ok(status)
    }

    /// Current status; `Unavailable` until `initialize()` has run.
    pub fn status(&self) -> ServiceStatus {
        self.read_lifecycle(|l| l.status.unwrap_or(ServiceStatus::Unavailable))
    }

    pub fn health(&self) -> MemoryHealth {
        self.read_lifecycle(|l| MemoryHealth {
            status: l.status.unwrap_or(ServiceStatus::Unavailable),
            initialized: l.status.is_some(),
            extractor_ready: l.extractor_ready,
            collective_ready: l.collective_ready,
            tracked_user_locks: self.locks.len(),
            read_permits_available: self.read_limiter.available_permits(),
            error: l.init_error.as_ref().map(|e| e.to_string()),
        })
    }

    /// Fail fast unless the service is usable.
    fn ensure_usable(&self) -> Result<(), MemoryError> {
        self.read_lifecycle(|l| match (&l.init_error, l.status) {
            (Some(err), _) => Err(MemoryError::Unavailable(err.to_string())),
            (None, Some(ServiceStatus::Unavailable)) => {
                Err(MemoryError::Unavailable("memory store not connected".to_string()))
            }
            (None, None) => Err(MemoryError::NotInitialized),
            (None, Some(_)) => Ok(()),
        })
    }

    async fn with_store_timeout<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T, MemoryError>>,
    ) -> Result<T, MemoryError> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(MemoryError::store(
                    format!("{op} timed out after {}ms", self.config.store_timeout.as_millis()),
                    ErrorCategory::Transient,
                ))
            })
    }

    /// Read a user's memory through the bounded read limiter.
    pub async fn get_user_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError> {
        self.ensure_usable()?;
        let _permit = self
            .read_limiter
            .acquire()
            .await
            .map_err(|_| MemoryError::Unavailable("read limiter closed".to_string()))?;
        self.with_store_timeout("load_context", self.store.load_context(user_id))
            .await
    }

    /// Extract and persist facts from one exchange under the user's lock.
    pub async fn process_conversation(
        &self,
        user_id: &str,
        user_message: &str,
        ai_response: &str,
    ) -> Result<MemoryProcessResult, MemoryError> {
        self.ensure_usable()?;
        let started = Instant::now();

        let lock = self.locks.lock_for(user_id);
        let Ok(_guard) = tokio::time::timeout(self.config.write_lock_timeout, lock.lock()).await
        else {
            warn!(
                user_id,
                timeout_ms = self.config.write_lock_timeout.as_millis() as u64,
                "write lock busy, dropping memory update"
            );
            return Ok(MemoryProcessResult::skipped(started));
        };

        let (extractor_ready, collective_ready) =
            self.read_lifecycle(|l| (l.extractor_ready, l.collective_ready));

        let mut success = true;
        let mut accepted = Vec::new();
        let mut extraction = Extraction::default();
        if let (true, Some(extractor)) = (extractor_ready, &self.extractor) {
            let context = self
                .with_store_timeout("load_context", self.store.load_context(user_id))
                .await?;
            match extractor.extract(user_message, ai_response, &context).await {
                Ok(found) => {
                    accepted = self
                        .config
                        .fact_policy
                        .accept(&context.profile_facts, &found.facts);
                    extraction = found;
                }
                Err(e) => {
                    warn!(user_id, error = %e, "fact extraction failed, saving counters only");
                    success = false;
                }
            }
        }

        let facts_extracted = extraction.facts.len();
        let update = MemoryUpdate::default()
            .with_facts(extraction.facts)
            .with_summary(extraction.summary)
            .increment("conversations", 1)
            .increment("messages", 2)
            .with_policy(self.config.fact_policy.clone());
        let facts_saved = self
            .with_store_timeout("apply_update", self.store.apply_update(user_id, update))
            .await?;

        if collective_ready && facts_saved > 0 {
            if let Some(collective) = &self.collective {
                if let Err(e) = collective.record(user_id, &accepted).await {
                    warn!(user_id, error = %e, "collective memory update failed");
                }
            }
        }

        let result = MemoryProcessResult {
            facts_extracted,
            facts_saved,
            processing_time_ms: started.elapsed().as_millis() as u64,
            success,
        };
        debug!(
            user_id,
            facts_extracted,
            facts_saved,
            elapsed_ms = result.processing_time_ms,
            "memory updated"
        );
        Ok(result)
    }

    /// Most common cross-user facts. Empty when collective memory is off.
    pub async fn collective_insights(&self, limit: usize) -> Vec<CollectiveInsight> {
        if !self.read_lifecycle(|l| l.collective_ready) {
            return Vec::new();
        }
        let Some(collective) = &self.collective else {
            return Vec::new();
        };
        match collective.top_insights(limit).await {
            Ok(insights) => insights,
            Err(e) => {
                warn!(error = %e, "collective insights unavailable");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::collective::InMemoryCollectiveMemory;
    use crate::memory::extractor::PatternFactExtractor;
    use crate::memory::store::InMemoryMemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper that counts calls, tracks concurrency, and can be slow.
    #[derive(Default)]
    struct InstrumentedStore {
        inner: InMemoryMemoryStore,
        connect_error: Option<MemoryError>,
        delay: Duration,
        calls: AtomicUsize,
        loads_in_flight: AtomicUsize,
        max_loads_in_flight: AtomicUsize,
        writes_in_flight: std::sync::Mutex<HashMap<String, usize>>,
        max_same_user_writes: AtomicUsize,
    }

    #[async_trait]
    impl MemoryStore for InstrumentedStore {
        async fn connect(&self) -> Result<(), MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.connect_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn load_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.loads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_loads_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.loads_in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.load_context(user_id).await
        }

        async fn apply_update(
            &self,
            user_id: &str,
            update: MemoryUpdate,
        ) -> Result<usize, MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut w = self.writes_in_flight.lock().unwrap();
                let n = w.entry(user_id.to_string()).or_insert(0);
                *n += 1;
                self.max_same_user_writes.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            *self
                .writes_in_flight
                .lock()
                .unwrap()
                .get_mut(user_id)
                .unwrap() -= 1;
            self.inner.apply_update(user_id, update).await
        }
    }

    struct BrokenExtractor;

    #[async_trait]
    impl FactExtractor for BrokenExtractor {
        fn name(&self) -> &str {
            "broken"
        }
        async fn initialize(&self) -> Result<(), MemoryError> {
            Err(MemoryError::Extraction("No module named 'spacy'".into()))
        }
        async fn extract(
            &self,
            _user_message: &str,
            _ai_response: &str,
            _context: &MemoryContext,
        ) -> Result<Extraction, MemoryError> {
            panic!("extract must not run when initialization failed")
        }
    }

    fn healthy(store: Arc<InstrumentedStore>) -> MemoryOrchestrator {
        MemoryOrchestrator::new(store, MemoryConfig::default())
            .with_extractor(Arc::new(PatternFactExtractor::new()))
            .with_collective(Arc::new(InMemoryCollectiveMemory::new(1)))
    }

    #[tokio::test]
    async fn test_healthy_round_trip() {
        let store = Arc::new(InstrumentedStore::default());
        let mo = healthy(store);
        assert_eq!(mo.initialize().await.unwrap(), ServiceStatus::Healthy);

        let result = mo
            .process_conversation("u1", "I work as a notary in Rome.", "Noted.")
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.facts_extracted, 1);
        assert_eq!(result.facts_saved, 1);

        let ctx = mo.get_user_context("u1").await.unwrap();
        assert_eq!(ctx.profile_facts, vec!["I work as a notary in Rome".to_string()]);
        assert_eq!(ctx.counters["conversations"], 1);
        assert_eq!(mo.collective_insights(5).await.len(), 1);
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail() {
        let mo = healthy(Arc::new(InstrumentedStore::default()));
        assert_eq!(mo.status(), ServiceStatus::Unavailable);
        assert_eq!(
            mo.get_user_context("u1").await.unwrap_err(),
            MemoryError::NotInitialized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_user_writes_serialise_other_users_run_in_parallel() {
        let store = Arc::new(InstrumentedStore {
            delay: Duration::from_millis(100),
            ..InstrumentedStore::default()
        });
        let mo = Arc::new(
            MemoryOrchestrator::new(store.clone(), MemoryConfig::default())
                .with_extractor(Arc::new(PatternFactExtractor::new())),
        );
        mo.initialize().await.unwrap();

        // Different users: one store round (load + write) in parallel.
        let start = Instant::now();
        let (a, b) = tokio::join!(
            mo.process_conversation("u", "hello", "hi"),
            mo.process_conversation("v", "hello", "hi"),
        );
        a.unwrap();
        b.unwrap();
        let parallel = start.elapsed();
        assert!(parallel < Duration::from_millis(250), "took {parallel:?}");

        // Same user: the second critical section waits for the first.
        let start = Instant::now();
        let (a, b) = tokio::join!(
            mo.process_conversation("u", "hello", "hi"),
            mo.process_conversation("u", "hello", "hi"),
        );
        a.unwrap();
        b.unwrap();
        let serial = start.elapsed();
        assert!(serial >= Duration::from_millis(400), "took {serial:?}");
        assert_eq!(store.max_same_user_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_when_extractor_fails() {
        let store = Arc::new(InstrumentedStore::default());
        let mo = MemoryOrchestrator::new(store, MemoryConfig::default())
            .with_extractor(Arc::new(BrokenExtractor));
        assert_eq!(mo.initialize().await.unwrap(), ServiceStatus::Degraded);
        assert_eq!(mo.status(), ServiceStatus::Degraded);

        let ctx = mo.get_user_context("u1").await.unwrap();
        assert_eq!(ctx.user_id, "u1");

        let result = mo
            .process_conversation("u1", "I own a pharmacy in Bari.", "ok")
            .await
            .unwrap();
        assert_eq!(result.facts_saved, 0);
        // Counters still move in degraded mode.
        let ctx = mo.get_user_context("u1").await.unwrap();
        assert_eq!(ctx.counters["conversations"], 1);
        assert!(!mo.health().extractor_ready);
    }

    #[tokio::test]
    async fn test_unavailable_fails_fast_and_keeps_error() {
        let connect_error = MemoryError::StoreConnect {
            message: "connection refused".into(),
            category: ErrorCategory::Transient,
        };
        let store = Arc::new(InstrumentedStore {
            connect_error: Some(connect_error.clone()),
            ..InstrumentedStore::default()
        });
        let mo = healthy(store.clone());

        assert_eq!(mo.initialize().await.unwrap_err(), connect_error);
        assert_eq!(mo.status(), ServiceStatus::Unavailable);
        let calls_after_init = store.calls.load(Ordering::SeqCst);

        assert!(matches!(
            mo.get_user_context("u1").await,
            Err(MemoryError::Unavailable(_))
        ));
        assert!(matches!(
            mo.process_conversation("u1", "a", "b").await,
            Err(MemoryError::Unavailable(_))
        ));
        // Re-initialising returns the stored error without reconnecting.
        assert_eq!(mo.initialize().await.unwrap_err(), connect_error);
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_after_init);
        assert!(mo.health().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_twenty_concurrent_reads_queue_behind_limiter() {
        let store = Arc::new(InstrumentedStore {
            delay: Duration::from_millis(50),
            ..InstrumentedStore::default()
        });
        let mo = Arc::new(healthy(store.clone()));
        mo.initialize().await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let mo = Arc::clone(&mo);
                tokio::spawn(async move { mo.get_user_context("u1").await })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert!(store.max_loads_in_flight.load(Ordering::SeqCst) <= 10);
        assert_eq!(mo.health().read_permits_available, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_lock_timeout_returns_empty_result() {
        let store = Arc::new(InstrumentedStore {
            delay: Duration::from_secs(30),
            ..InstrumentedStore::default()
        });
        let config = MemoryConfig {
            write_lock_timeout: Duration::from_secs(1),
            store_timeout: Duration::from_secs(120),
            ..MemoryConfig::default()
        };
        let mo = Arc::new(
            MemoryOrchestrator::new(store, config)
                .with_extractor(Arc::new(PatternFactExtractor::new())),
        );
        mo.initialize().await.unwrap();

        let slow = {
            let mo = Arc::clone(&mo);
            tokio::spawn(async move { mo.process_conversation("u1", "I am a lawyer.", "ok").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = mo
            .process_conversation("u1", "I am a lawyer.", "ok")
            .await
            .unwrap();
        assert_eq!(result.facts_saved, 0);
        assert!(!result.success);

        assert_eq!(slow.await.unwrap().unwrap().facts_saved, 1);
    }
}
