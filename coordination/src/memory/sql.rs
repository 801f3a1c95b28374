//! Relational memory store over a narrow connection-pool interface.
//!
//! The SQL driver is an external collaborator: the store only needs
//! `acquire()` on a pool and `execute` / `fetchrow` / `fetch` on a
//! connection. Writes run inside one transaction with the user's profile
//! row locked, so concurrent readers see either the old or the new record.
//!
//! ```text
//! memory_profiles (user_id PK, summary, updated_at)
//! memory_facts    (id BIGSERIAL, user_id, fact, created_at)
//! memory_counters (user_id, name, value)  PK (user_id, name)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::errors::MemoryError;
use super::store::{MemoryContext, MemoryStore, MemoryUpdate};
use crate::resilience::ErrorCategory;

/// Parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.columns.push((name.to_string(), value.into()));
        self
    }

    pub fn push(&mut self, name: &str, value: SqlValue) {
        self.columns.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(SqlValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            Some(SqlValue::Timestamp(t)) => Some(*t),
            _ => None,
        }
    }
}

/// Driver-level failure, already classified by the driver adapter.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SqlError {
    pub message: String,
    pub category: ErrorCategory,
}

impl SqlError {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }
}

/// One checked-out connection.
#[async_trait]
pub trait SqlConnection: Send {
    /// Run a statement; returns affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, SqlError>;
    async fn fetchrow(&mut self, sql: &str, params: &[SqlValue])
        -> Result<Option<SqlRow>, SqlError>;
    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError>;
}

/// Connection pool.
#[async_trait]
pub trait SqlPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SqlConnection>, SqlError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS memory_profiles (
        user_id TEXT PRIMARY KEY,
        summary TEXT NOT NULL DEFAULT '',
        updated_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS memory_facts (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        fact TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS memory_facts_user_idx ON memory_facts (user_id, id)",
    "CREATE TABLE IF NOT EXISTS memory_counters (
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        value BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, name)
    )",
];

fn store_err(e: SqlError) -> MemoryError {
    MemoryError::store(e.message, e.category)
}

/// [`MemoryStore`] backed by a relational database.
pub struct SqlMemoryStore {
    pool: Arc<dyn SqlPool>,
}

impl SqlMemoryStore {
    pub fn new(pool: Arc<dyn SqlPool>) -> Self {
        Self { pool }
    }

    async fn read_snapshot(
        conn: &mut dyn SqlConnection,
        user_id: &str,
    ) -> Result<MemoryContext, SqlError> {
        let uid = [SqlValue::from(user_id)];
        let mut ctx = MemoryContext::empty(user_id);
        if let Some(row) = conn
            .fetchrow(
                "SELECT summary, updated_at FROM memory_profiles WHERE user_id = $1",
                &uid,
            )
            .await?
        {
            ctx.summary = row.text("summary").unwrap_or_default().to_string();
            ctx.updated_at = row.timestamp("updated_at");
        }
        ctx.profile_facts = conn
            .fetch(
                "SELECT fact FROM memory_facts WHERE user_id = $1 ORDER BY id ASC",
                &uid,
            )
            .await?
            .iter()
            .filter_map(|r| r.text("fact").map(str::to_string))
            .collect();
        for row in conn
            .fetch(
                "SELECT name, value FROM memory_counters WHERE user_id = $1",
                &uid,
            )
            .await?
        {
            if let (Some(name), Some(value)) = (row.text("name"), row.int("value")) {
                ctx.counters.insert(name.to_string(), value);
            }
        }
        Ok(ctx)
    }

    async fn write_update(
        conn: &mut dyn SqlConnection,
        user_id: &str,
        update: &MemoryUpdate,
    ) -> Result<usize, SqlError> {
        let uid = SqlValue::from(user_id);
        let now = Utc::now();
        conn.execute(
            "INSERT INTO memory_profiles (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
            std::slice::from_ref(&uid),
        )
        .await?;
        // Row lock serialises writers for this user across processes.
        conn.fetchrow(
            "SELECT user_id FROM memory_profiles WHERE user_id = $1 FOR UPDATE",
            std::slice::from_ref(&uid),
        )
        .await?;

        let existing: Vec<String> = conn
            .fetch(
                "SELECT fact FROM memory_facts WHERE user_id = $1 ORDER BY id ASC",
                std::slice::from_ref(&uid),
            )
            .await?
            .iter()
            .filter_map(|r| r.text("fact").map(str::to_string))
            .collect();
        let accepted = update.policy.accept(&existing, &update.facts);
        for fact in &accepted {
            conn.execute(
                "INSERT INTO memory_facts (user_id, fact, created_at) VALUES ($1, $2, $3)",
                &[uid.clone(), SqlValue::from(fact.as_str()), SqlValue::from(now)],
            )
            .await?;
        }
        if update.policy.max_facts > 0 && existing.len() + accepted.len() > update.policy.max_facts
        {
            conn.execute(
                "DELETE FROM memory_facts WHERE user_id = $1 AND id NOT IN \
                 (SELECT id FROM memory_facts WHERE user_id = $1 ORDER BY id DESC LIMIT $2)",
                &[uid.clone(), SqlValue::Int(update.policy.max_facts as i64)],
            )
            .await?;
        }

        for (name, delta) in &update.counter_deltas {
            conn.execute(
                "INSERT INTO memory_counters (user_id, name, value) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, name) DO UPDATE SET value = memory_counters.value + EXCLUDED.value",
                &[uid.clone(), SqlValue::from(name.as_str()), SqlValue::Int(*delta)],
            )
            .await?;
        }

        match &update.summary {
            Some(summary) => {
                conn.execute(
                    "UPDATE memory_profiles SET summary = $2, updated_at = $3 WHERE user_id = $1",
                    &[uid.clone(), SqlValue::from(summary.as_str()), SqlValue::from(now)],
                )
                .await?
            }
            None => {
                conn.execute(
                    "UPDATE memory_profiles SET updated_at = $2 WHERE user_id = $1",
                    &[uid.clone(), SqlValue::from(now)],
                )
                .await?
            }
        };
        Ok(accepted.len())
    }
}

#[async_trait]
impl MemoryStore for SqlMemoryStore {
    async fn connect(&self) -> Result<(), MemoryError> {
        let to_connect_err = |e: SqlError| MemoryError::StoreConnect {
            message: e.message,
            category: e.category,
        };
        let mut conn = self.pool.acquire().await.map_err(to_connect_err)?;
        conn.execute("SELECT 1", &[]).await.map_err(to_connect_err)?;
        for statement in SCHEMA {
            conn.execute(statement, &[]).await.map_err(to_connect_err)?;
        }
        debug!("memory schema ready");
        Ok(())
    }

    async fn load_context(&self, user_id: &str) -> Result<MemoryContext, MemoryError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY", &[])
            .await
            .map_err(store_err)?;
        let result = Self::read_snapshot(conn.as_mut(), user_id).await;
        finish(conn.as_mut(), result.is_ok()).await;
        result.map_err(store_err)
    }

    async fn apply_update(
        &self,
        user_id: &str,
        update: MemoryUpdate,
    ) -> Result<usize, MemoryError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN", &[]).await.map_err(store_err)?;
        match Self::write_update(conn.as_mut(), user_id, &update).await {
            Ok(saved) => {
                conn.execute("COMMIT", &[]).await.map_err(store_err)?;
                Ok(saved)
            }
            Err(e) => {
                finish(conn.as_mut(), false).await;
                Err(store_err(e))
            }
        }
    }
}

/// Close a transaction. Rollback failures are logged and swallowed.
async fn finish(conn: &mut dyn SqlConnection, commit: bool) {
    let statement = if commit { "COMMIT" } else { "ROLLBACK" };
    if let Err(e) = conn.execute(statement, &[]).await {
        warn!(error = %e, statement, "failed to close transaction");
    }
}
