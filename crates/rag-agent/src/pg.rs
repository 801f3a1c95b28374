//! Postgres adapter for the memory store's `SqlPool` interface.
//!
//! A small pool over `tokio-postgres`: a semaphore caps open connections,
//! idle clients are reused, and new connections are opened with
//! exponential backoff on transient failures (refused, reset, server
//! starting up). Authentication and configuration errors fail on the first
//! attempt.
//!
//! A connection dropped while a transaction is open is discarded rather
//! than returned to the pool.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use coordination::memory::{SqlConnection, SqlError, SqlPool, SqlRow, SqlValue};
use coordination::resilience::retry_with_backoff;
use coordination::{classify, BackoffPolicy, ErrorCategory};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

/// Default cap on open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Classify a five-character SQLSTATE code.
pub fn classify_sqlstate(code: &str) -> ErrorCategory {
    match code {
        // admin shutdown, crash shutdown, cannot connect now
        "57P01" | "57P02" | "57P03" => ErrorCategory::Transient,
        // query cancelled (statement timeout)
        "57014" => ErrorCategory::Transient,
        _ => match code.get(..2) {
            // connection exception, transaction rollback, insufficient resources
            Some("08") | Some("40") | Some("53") => ErrorCategory::Transient,
            // data, integrity, auth, syntax/access, config
            Some("22") | Some("23") | Some("28") | Some("42") | Some("F0") => {
                ErrorCategory::Permanent
            }
            _ => ErrorCategory::Unknown,
        },
    }
}

fn sql_error(context: &str, e: tokio_postgres::Error) -> SqlError {
    let category = match e.code() {
        Some(state) => classify_sqlstate(state.code()),
        None if e.is_closed() => ErrorCategory::Transient,
        None => classify(&e),
    };
    SqlError::new(format!("{context}: {e}"), category)
}

fn to_params(values: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values
        .iter()
        .map(|v| -> Box<dyn ToSql + Sync + Send> {
            match v {
                SqlValue::Null => Box::new(Option::<String>::None),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Timestamp(t) => Box::new(*t),
            }
        })
        .collect()
}

fn decode_row(row: &Row) -> Result<SqlRow, tokio_postgres::Error> {
    let mut out = SqlRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(SqlValue::Timestamp)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|t| SqlValue::Timestamp(t.and_utc()))
        } else {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        };
        out.push(column.name(), value.unwrap_or(SqlValue::Null));
    }
    Ok(out)
}

struct PoolInner {
    config: tokio_postgres::Config,
    idle: Mutex<Vec<Client>>,
    permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl PoolInner {
    fn take_idle(&self) -> Option<Client> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(client) = idle.pop() {
            if !client.is_closed() {
                return Some(client);
            }
        }
        None
    }

    fn give_back(&self, client: Client) {
        if !client.is_closed() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(client);
        }
    }

    async fn connect_once(&self) -> Result<Client, SqlError> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| sql_error("connect", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Postgres connection closed with error");
            }
        });
        debug!("Opened Postgres connection");
        Ok(client)
    }
}

/// Bounded Postgres connection pool.
#[derive(Clone)]
pub struct PostgresPool {
    inner: Arc<PoolInner>,
}

impl PostgresPool {
    /// Parse `url` without connecting.
    pub fn new(url: &str, max_connections: usize, backoff: BackoffPolicy) -> Result<Self, SqlError> {
        let config: tokio_postgres::Config = url.parse().map_err(|e: tokio_postgres::Error| {
            SqlError::new(format!("invalid database url: {e}"), ErrorCategory::Permanent)
        })?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_connections.max(1))),
                backoff,
            }),
        })
    }

    pub fn idle_connections(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SqlPool for PostgresPool {
    async fn acquire(&self) -> Result<Box<dyn SqlConnection>, SqlError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| SqlError::new("connection pool closed", ErrorCategory::Permanent))?;
        let client = match self.inner.take_idle() {
            Some(client) => client,
            None => {
                let inner = &self.inner;
                retry_with_backoff(
                    &inner.backoff,
                    "postgres connect",
                    |_| inner.connect_once(),
                    |e: &SqlError| e.category,
                )
                .await?
            }
        };
        Ok(Box::new(PgConnection {
            client: Some(client),
            pool: Arc::clone(&self.inner),
            in_transaction: false,
            _permit: permit,
        }))
    }
}

/// Checked-out connection; returns itself to the pool on drop.
struct PgConnection {
    client: Option<Client>,
    pool: Arc<PoolInner>,
    in_transaction: bool,
    _permit: OwnedSemaphorePermit,
}

impl PgConnection {
    fn client(&self) -> Result<&Client, SqlError> {
        self.client
            .as_ref()
            .ok_or_else(|| SqlError::new("connection already released", ErrorCategory::Permanent))
    }

    fn track_transaction(&mut self, sql: &str) {
        let head = sql.trim_start().to_ascii_uppercase();
        if head.starts_with("BEGIN") || head.starts_with("START TRANSACTION") {
            self.in_transaction = true;
        } else if head.starts_with("COMMIT") || head.starts_with("ROLLBACK") {
            self.in_transaction = false;
        }
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.in_transaction {
                debug!("Discarding connection with an open transaction");
            } else {
                self.pool.give_back(client);
            }
        }
    }
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, SqlError> {
        let boxed = to_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| &**b as &(dyn ToSql + Sync)).collect();
        let affected = self
            .client()?
            .execute(sql, &refs)
            .await
            .map_err(|e| sql_error("execute", e))?;
        self.track_transaction(sql);
        Ok(affected)
    }

    async fn fetchrow(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>, SqlError> {
        let boxed = to_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| &**b as &(dyn ToSql + Sync)).collect();
        let row = self
            .client()?
            .query_opt(sql, &refs)
            .await
            .map_err(|e| sql_error("fetchrow", e))?;
        row.as_ref()
            .map(decode_row)
            .transpose()
            .map_err(|e| sql_error("decode", e))
    }

    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError> {
        let boxed = to_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| &**b as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client()?
            .query(sql, &refs)
            .await
            .map_err(|e| sql_error("fetch", e))?;
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| sql_error("decode", e))
    }
}
