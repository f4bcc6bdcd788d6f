//! Execution log
//!
//! One row per layer run in `log_execution`, recording the step, its outcome and a
//! human-readable message. The table is created on first use.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::{EtlError, Result};
use crate::extract::postgres::quote_ident;

pub const LOG_TABLE: &str = "log_execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "ERROR" => Ok(ExecutionStatus::Error),
            other => Err(EtlError::Config(format!("unknown execution status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionLogEntry {
    pub step: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub execution_time: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(step: impl Into<String>, status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status,
            message: message.into(),
            execution_time: Utc::now(),
        }
    }
}

/// Append-only store of layer run outcomes
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, entry: &ExecutionLogEntry) -> Result<()>;

    /// Most recent entries, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>>;
}

pub struct PgExecutionLog {
    pool: PgPool,
    table: String,
    schema: String,
    ready: OnceCell<()>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    step: Option<String>,
    status: Option<String>,
    message: Option<String>,
    execution_time: Option<NaiveDateTime>,
}

impl PgExecutionLog {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        Self {
            pool,
            table: format!("{}.{}", quote_ident(&schema), quote_ident(LOG_TABLE)),
            schema,
            ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                debug!(table = %self.table, "Ensuring execution log table");
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)))
                    .execute(&self.pool)
                    .await?;
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        id SERIAL PRIMARY KEY,
                        step VARCHAR(100),
                        status VARCHAR(20),
                        message TEXT,
                        execution_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                    )
                    "#,
                    self.table
                ))
                .execute(&self.pool)
                .await?;
                Ok::<(), EtlError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionLog for PgExecutionLog {
    async fn append(&self, entry: &ExecutionLogEntry) -> Result<()> {
        self.ensure_table().await?;

        sqlx::query(&format!(
            "INSERT INTO {} (step, status, message, execution_time) VALUES ($1, $2, $3, $4)",
            self.table
        ))
        .bind(&entry.step)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(entry.execution_time.naive_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.ensure_table().await?;

        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT step, status, message, execution_time FROM {} \
             ORDER BY execution_time DESC NULLS LAST, id DESC LIMIT $1",
            self.table
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ExecutionLogEntry> {
                Ok(ExecutionLogEntry {
                    step: row.step.unwrap_or_default(),
                    status: row.status.as_deref().unwrap_or_default().parse()?,
                    message: row.message.unwrap_or_default(),
                    execution_time: row
                        .execution_time
                        .map(|ts| ts.and_utc())
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                })
            })
            .collect()
    }
}

/// In-process log used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryExecutionLog {
    entries: Mutex<Vec<ExecutionLogEntry>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in append order
    pub async fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn append(&self, entry: &ExecutionLogEntry) -> Result<()> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_recent_is_newest_first() {
        let log = MemoryExecutionLog::new();
        for step in ["pipeline_bronze", "pipeline_silver", "pipeline_gold"] {
            log.append(&ExecutionLogEntry::new(step, ExecutionStatus::Success, "ok"))
                .await
                .unwrap();
        }

        let recent = log.recent(2).await.unwrap();
        let steps: Vec<_> = recent.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(steps, vec!["pipeline_gold", "pipeline_silver"]);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        assert_eq!("ERROR".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Error);
        assert!("error".parse::<ExecutionStatus>().is_err());
    }
}
