//! Remote PostgreSQL table extractor

use futures::{StreamExt, TryStreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use super::rows::row_to_record;
use super::{Extractor, RecordStream};
use crate::error::{EtlError, Result};

/// Streams `SELECT * FROM <table>` from a source database
pub struct PgTableExtractor {
    entity: String,
    table: String,
    sql: String,
    pool: PgPool,
}

impl PgTableExtractor {
    /// Create an extractor over a lazily connected pool
    pub fn connect_lazy(
        entity: impl Into<String>,
        database_url: &str,
        table: impl Into<String>,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|e| EtlError::Config(format!("invalid source database URL: {}", e)))?;
        Ok(Self::with_pool(entity, table, pool))
    }

    pub fn with_pool(entity: impl Into<String>, table: impl Into<String>, pool: PgPool) -> Self {
        let table = table.into();
        let sql = format!("SELECT * FROM {}", quote_ident(&table));
        Self {
            entity: entity.into(),
            table,
            sql,
            pool,
        }
    }
}

impl Extractor for PgTableExtractor {
    fn entity(&self) -> &str {
        &self.entity
    }

    fn extract(&self) -> RecordStream<'_> {
        info!(entity = %self.entity, table = %self.table, "Reading source table");
        sqlx::query(&self.sql)
            .fetch(&self.pool)
            .and_then(|row| async move { row_to_record(&row) })
            .map_err(move |e| EtlError::from_read(&self.entity, e))
            .boxed()
    }
}

/// Double-quote a SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
