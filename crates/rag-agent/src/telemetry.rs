//! Per-turn telemetry.
//!
//! One [`TurnTelemetry`] is filled in as a turn progresses and emitted as a
//! single structured log line when the turn ends. When a JSONL path is
//! configured the record is also appended there, one object per line.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Done,
    Error,
    /// The client went away before the turn finished.
    Cancelled,
}

impl std::fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything worth knowing about one turn, after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub correlation_id: String,
    pub user_id: String,
    pub tier: String,
    pub outcome: TurnOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub fallbacks: usize,
    pub passages: usize,
    pub memory_loaded: bool,
    pub tokens_streamed: usize,
    pub answer_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    /// Non-fatal `error` events emitted.
    pub warnings: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub context_ms: u64,
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub elapsed_ms: u64,
    pub memory_write_queued: bool,
    pub timestamp: String,
}

/// Collector filled in while a turn runs.
pub struct TurnTelemetry {
    started: Instant,
    record: TurnRecord,
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl TurnTelemetry {
    pub fn new(correlation_id: &str, user_id: &str, tier: &str) -> Self {
        Self {
            started: Instant::now(),
            record: TurnRecord {
                correlation_id: correlation_id.to_string(),
                user_id: user_id.to_string(),
                tier: tier.to_string(),
                outcome: TurnOutcome::Error,
                provider: None,
                fallbacks: 0,
                passages: 0,
                memory_loaded: false,
                tokens_streamed: 0,
                answer_chars: 0,
                verified: None,
                warnings: 0,
                error_type: None,
                context_ms: 0,
                retrieval_ms: 0,
                generation_ms: 0,
                elapsed_ms: 0,
                memory_write_queued: false,
                timestamp: Utc::now().to_rfc3339(),
            },
        }
    }

    pub fn record_context(&mut self, loaded: bool, elapsed: Duration) {
        self.record.memory_loaded = loaded;
        self.record.context_ms = ms(elapsed);
    }

    pub fn record_retrieval(&mut self, passages: usize, elapsed: Duration) {
        self.record.passages = passages;
        self.record.retrieval_ms = ms(elapsed);
    }

    pub fn record_provider(&mut self, provider: &str, fallbacks: usize) {
        self.record.provider = Some(provider.to_string());
        self.record.fallbacks = fallbacks;
    }

    pub fn record_generation(&mut self, elapsed: Duration) {
        self.record.generation_ms = ms(elapsed);
    }

    pub fn record_token(&mut self, text: &str) {
        self.record.tokens_streamed += 1;
        self.record.answer_chars += text.chars().count();
    }

    pub fn record_verification(&mut self, passed: bool) {
        self.record.verified = Some(passed);
    }

    pub fn record_warning(&mut self) {
        self.record.warnings += 1;
    }

    pub fn record_memory_write(&mut self, queued: bool) {
        self.record.memory_write_queued = queued;
    }

    pub fn tier(&self) -> &str {
        &self.record.tier
    }

    /// Close the record. `error_type` is kept only for non-`Done` outcomes.
    pub fn finish(mut self, outcome: TurnOutcome, error_type: Option<&str>) -> TurnRecord {
        self.record.outcome = outcome;
        self.record.error_type = match outcome {
            TurnOutcome::Done => None,
            _ => error_type.map(String::from),
        };
        self.record.elapsed_ms = ms(self.started.elapsed());
        self.record
    }
}

impl TurnRecord {
    /// Log the record as one structured line.
    pub fn emit(&self) {
        info!(
            correlation_id = %self.correlation_id,
            user_id = %self.user_id,
            tier = %self.tier,
            outcome = %self.outcome,
            provider = self.provider.as_deref().unwrap_or("-"),
            fallbacks = self.fallbacks,
            passages = self.passages,
            memory_loaded = self.memory_loaded,
            tokens = self.tokens_streamed,
            warnings = self.warnings,
            error_type = self.error_type.as_deref().unwrap_or("-"),
            context_ms = self.context_ms,
            retrieval_ms = self.retrieval_ms,
            generation_ms = self.generation_ms,
            elapsed_ms = self.elapsed_ms,
            "Turn finished"
        );
    }
}

/// Append a record to a JSONL file. Failures are logged, never returned.
pub fn append_turn_record(record: &TurnRecord, path: &Path) {
    match serde_json::to_string(record) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append turn telemetry: {e}");
                    }
                }
                Err(e) => warn!("Failed to open turn telemetry file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize turn telemetry: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_basic_flow() {
        let mut t = TurnTelemetry::new("c-1", "u-1", "flash");
        t.record_context(true, Duration::from_millis(12));
        t.record_retrieval(3, Duration::from_millis(40));
        t.record_provider("primary", 1);
        t.record_token("Hello ");
        t.record_token("wörld");
        t.record_generation(Duration::from_millis(300));
        t.record_memory_write(true);
        let record = t.finish(TurnOutcome::Done, Some("ignored"));

        assert_eq!(record.outcome, TurnOutcome::Done);
        assert_eq!(record.provider.as_deref(), Some("primary"));
        assert_eq!(record.passages, 3);
        assert_eq!(record.tokens_streamed, 2);
        assert_eq!(record.answer_chars, 11);
        assert_eq!(record.context_ms, 12);
        assert!(record.error_type.is_none());
        assert!(record.memory_write_queued);
    }

    #[test]
    fn test_error_outcome_keeps_error_type() {
        let mut t = TurnTelemetry::new("c-2", "u-1", "pro");
        t.record_warning();
        let record = t.finish(TurnOutcome::Error, Some("provider_exhausted"));
        assert_eq!(record.error_type.as_deref(), Some("provider_exhausted"));
        assert_eq!(record.warnings, 1);
        assert!(record.provider.is_none());
    }

    #[test]
    fn test_append_turn_record_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");

        let r1 = TurnTelemetry::new("c-1", "u", "flash").finish(TurnOutcome::Done, None);
        let r2 = TurnTelemetry::new("c-2", "u", "flash").finish(TurnOutcome::Cancelled, None);
        append_turn_record(&r1, &path);
        append_turn_record(&r2, &path);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let loaded: TurnRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(loaded.correlation_id, "c-2");
        assert_eq!(loaded.outcome, TurnOutcome::Cancelled);
    }
}
