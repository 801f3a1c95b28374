//! Fire-and-forget memory writes.
//!
//! A finished turn hands its (question, answer) pair to a bounded queue and
//! returns immediately. A supervised worker drains the queue on its own
//! task, outside any request's cancellation scope, so a client that
//! disconnects after `done` does not lose the write.
//!
//! ```text
//! turn ──try_send──▶ [ mpsc (capacity N) ] ──▶ worker ──spawn──▶ process_conversation
//!                                                 │
//!                                                 └─ logs failures and panics, keeps going
//! ```
//!
//! A full queue drops the write with a warning rather than blocking the turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use coordination::{MemoryError, MemoryOrchestrator, MemoryProcessResult};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// One conversation exchange to remember.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryWriteJob {
    pub user_id: String,
    pub user_message: String,
    pub ai_response: String,
    pub correlation_id: String,
}

/// Destination of queued writes.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn write(&self, job: &MemoryWriteJob) -> Result<MemoryProcessResult, MemoryError>;
}

#[async_trait]
impl ConversationSink for MemoryOrchestrator {
    async fn write(&self, job: &MemoryWriteJob) -> Result<MemoryProcessResult, MemoryError> {
        self.process_conversation(&job.user_id, &job.user_message, &job.ai_response)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("memory write queue is full")]
    Full,
    #[error("memory write worker has stopped")]
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    /// Writes that returned an error, reported `success = false`, or panicked.
    pub failed: u64,
}

/// Producer side; cheap to clone.
#[derive(Clone)]
pub struct MemoryWriteQueue {
    tx: mpsc::Sender<MemoryWriteJob>,
    counters: Arc<Counters>,
}

/// Handle on the worker task. Resolves once every queue clone is dropped and
/// in-flight writes have finished.
pub struct MemoryWriteWorker {
    handle: JoinHandle<()>,
}

impl MemoryWriteWorker {
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Memory write worker terminated abnormally");
        }
    }
}

impl MemoryWriteQueue {
    /// Start the worker. At most `max_in_flight` writes run at once.
    pub fn spawn(
        sink: Arc<dyn ConversationSink>,
        capacity: usize,
        max_in_flight: usize,
    ) -> (Self, MemoryWriteWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let handle = tokio::spawn(run_worker(
            sink,
            rx,
            max_in_flight.max(1),
            Arc::clone(&counters),
        ));
        (Self { tx, counters }, MemoryWriteWorker { handle })
    }

    /// Hand a job to the worker without waiting.
    pub fn enqueue(&self, job: MemoryWriteJob) -> Result<(), EnqueueError> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user_id = %job.user_id,
                    correlation_id = %job.correlation_id,
                    "Memory write queue full, dropping write"
                );
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user_id = %job.user_id,
                    correlation_id = %job.correlation_id,
                    "Memory write worker stopped, dropping write"
                );
                Err(EnqueueError::Closed)
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

type WriteOutcome = (MemoryWriteJob, Result<MemoryProcessResult, MemoryError>);

fn record(counters: &Counters, outcome: Result<WriteOutcome, JoinError>) {
    match outcome {
        Ok((job, Ok(result))) if result.success => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                user_id = %job.user_id,
                correlation_id = %job.correlation_id,
                facts_extracted = result.facts_extracted,
                facts_saved = result.facts_saved,
                elapsed_ms = result.processing_time_ms,
                "Memory write completed"
            );
        }
        Ok((job, Ok(result))) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                user_id = %job.user_id,
                correlation_id = %job.correlation_id,
                facts_saved = result.facts_saved,
                "Memory write incomplete"
            );
        }
        Ok((job, Err(e))) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                user_id = %job.user_id,
                correlation_id = %job.correlation_id,
                error_type = e.error_type(),
                error = %e,
                "Memory write failed"
            );
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, panicked = e.is_panic(), "Memory write task aborted");
        }
    }
}

async fn run_worker(
    sink: Arc<dyn ConversationSink>,
    mut rx: mpsc::Receiver<MemoryWriteJob>,
    max_in_flight: usize,
    counters: Arc<Counters>,
) {
    let mut in_flight: JoinSet<WriteOutcome> = JoinSet::new();

    loop {
        while in_flight.len() >= max_in_flight {
            if let Some(outcome) = in_flight.join_next().await {
                record(&counters, outcome);
            }
        }

        tokio::select! {
            Some(outcome) = in_flight.join_next(), if !in_flight.is_empty() => {
                record(&counters, outcome);
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                let sink = Arc::clone(&sink);
                in_flight.spawn(async move {
                    let result = sink.write(&job).await;
                    (job, result)
                });
            }
        }
    }

    while let Some(outcome) = in_flight.join_next().await {
        record(&counters, outcome);
    }
    info!("Memory write worker stopped");
}
