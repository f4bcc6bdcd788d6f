//! PostgreSQL warehouse
//!
//! Each layer lives in its own schema, optionally on its own pool. A write runs as a
//! single transaction:
//!
//! 1. `CREATE SCHEMA` / `CREATE TABLE ... IF NOT EXISTS` with the merge key as primary key
//! 2. `ALTER TABLE ... ADD COLUMN IF NOT EXISTS` for columns the batch introduces
//! 3. `DELETE` of the current contents (replace mode only)
//! 4. chunked `INSERT ... ON CONFLICT (key) DO UPDATE`
//!
//! Values are bound as text and cast server-side to the column's declared type, so
//! columns created by an earlier load keep their type.

use async_trait::async_trait;
use medallion_common::Record;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{infer_columns, prepare_batch, sort_by_key, ColumnType, MergeSink, UpstreamReader};
use crate::config::WarehouseConfig;
use crate::error::{EtlError, Result};
use crate::extract::postgres::quote_ident;
use crate::extract::rows::row_to_record;
use crate::models::{Layer, LayerTarget, LoadSummary, TargetStatus, WriteMode};

/// PostgreSQL caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
struct LayerStore {
    pool: PgPool,
    schema: String,
}

#[derive(Debug, Clone, Default)]
pub struct PgWarehouse {
    stores: HashMap<Layer, LayerStore>,
}

impl PgWarehouse {
    /// All layers on one pool, each in the schema named after the layer
    pub fn single_pool(pool: PgPool) -> Self {
        Layer::ALL
            .into_iter()
            .fold(Self::default(), |wh, layer| wh.with_layer(layer, pool.clone(), layer.as_str()))
    }

    pub fn with_layer(mut self, layer: Layer, pool: PgPool, schema: impl Into<String>) -> Self {
        self.stores.insert(
            layer,
            LayerStore {
                pool,
                schema: schema.into(),
            },
        );
        self
    }

    /// Build lazily connected pools; layers sharing a URL share a pool
    pub fn connect_lazy(config: &WarehouseConfig) -> Result<Self> {
        let mut pools: HashMap<String, PgPool> = HashMap::new();
        let mut warehouse = Self::default();

        for (layer, store) in [
            (Layer::Bronze, &config.bronze),
            (Layer::Silver, &config.silver),
            (Layer::Gold, &config.gold),
        ] {
            let pool = match pools.get(&store.url) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = lazy_pool(&store.url, config)?;
                    pools.insert(store.url.clone(), pool.clone());
                    pool
                },
            };
            warehouse = warehouse.with_layer(layer, pool, store.schema.clone());
        }

        Ok(warehouse)
    }

    fn store(&self, layer: Layer) -> Result<&LayerStore> {
        self.stores
            .get(&layer)
            .ok_or_else(|| EtlError::Config(format!("no warehouse configured for layer {}", layer)))
    }
}

/// Lazily connected pool using the warehouse pool settings
pub fn lazy_pool(url: &str, config: &WarehouseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect_lazy(url)
        .map_err(|e| EtlError::Config(format!("invalid database URL: {}", e)))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

#[async_trait]
impl MergeSink for PgWarehouse {
    async fn write(&self, target: &LayerTarget, records: Vec<Record>) -> Result<LoadSummary> {
        let store = self.store(target.layer)?;
        let name = target.qualified_name();
        let mut summary = LoadSummary::new(target, records.len());
        let batch = prepare_batch(target, records)?;
        let columns = infer_columns(&batch);

        let mut tx = store
            .pool
            .begin()
            .await
            .map_err(|e| EtlError::from_write(&name, e))?;

        let table = qualified(&store.schema, target.entity);
        let column_types = ensure_table(&mut *tx, &store.schema, target, &columns)
            .await
            .map_err(|e| EtlError::from_write(&name, e))?;

        if target.mode == WriteMode::Replace {
            let deleted = sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(|e| EtlError::from_write(&name, e))?;
            summary.rows_removed = deleted.rows_affected() as usize;
        }

        if !batch.is_empty() {
            let names: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
            let rows_per_statement = (MAX_BIND_PARAMS / names.len().max(1)).max(1);

            for chunk in batch.chunks(rows_per_statement) {
                let sql = upsert_sql(&table, target.key.column(), &names, &column_types, chunk.len());
                let mut query = sqlx::query(&sql);
                for record in chunk {
                    for column in &names {
                        query = query.bind(record.get(column).and_then(|v| v.to_sql_text()));
                    }
                }

                let rows = query
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(|e| EtlError::from_write(&name, e))?;
                for row in rows {
                    let inserted: bool = row
                        .try_get("inserted")
                        .map_err(|e| EtlError::from_write(&name, e))?;
                    if inserted {
                        summary.rows_inserted += 1;
                    } else {
                        summary.rows_updated += 1;
                    }
                }
            }
        }

        tx.commit().await.map_err(|e| EtlError::from_write(&name, e))?;

        summary.rows_written = summary.rows_inserted + summary.rows_updated;
        if summary.rows_written > 0 {
            summary.status = TargetStatus::Loaded;
        }
        debug!(
            table = %name,
            inserted = summary.rows_inserted,
            updated = summary.rows_updated,
            removed = summary.rows_removed,
            "Write committed"
        );
        Ok(summary)
    }
}

/// Create the schema and table if needed and add missing columns
///
/// Returns the declared type of every column of the table.
async fn ensure_table(
    conn: &mut PgConnection,
    schema: &str,
    target: &LayerTarget,
    columns: &[(String, ColumnType)],
) -> std::result::Result<HashMap<String, String>, sqlx::Error> {
    let table = qualified(schema, target.entity);
    let key = target.key.column();
    let key_type = columns
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, ty)| *ty)
        .unwrap_or(ColumnType::Text);

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({} {} PRIMARY KEY)",
        table,
        quote_ident(key),
        key_type.sql_name()
    ))
    .execute(&mut *conn)
    .await?;

    let existing = column_types(&mut *conn, &table).await?;
    let mut altered = false;
    for (name, ty) in columns {
        let Some(declared) = existing.get(name) else {
            info!(table = %table, column = %name, column_type = ty.sql_name(), "Adding column");
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                table,
                quote_ident(name),
                ty.sql_name()
            ))
            .execute(&mut *conn)
            .await?;
            altered = true;
            continue;
        };

        // Columns of a type this sink never declares are left alone
        let Some(current) = ColumnType::from_sql_name(declared) else { continue };
        let widened = current.widen(*ty);
        if widened != current {
            info!(
                table = %table,
                column = %name,
                from = current.sql_name(),
                to = widened.sql_name(),
                "Widening column"
            );
            sqlx::query(&widen_column_sql(&table, name, widened))
                .execute(&mut *conn)
                .await?;
            altered = true;
        }
    }

    if altered {
        column_types(conn, &table).await
    } else {
        Ok(existing)
    }
}

fn widen_column_sql(table: &str, column: &str, to: ColumnType) -> String {
    format!(
        "ALTER TABLE {0} ALTER COLUMN {1} TYPE {2} USING {1}::{2}",
        table,
        quote_ident(column),
        to.sql_name()
    )
}

async fn column_types(
    conn: &mut PgConnection,
    table: &str,
) -> std::result::Result<HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT a.attname::text AS name, format_type(a.atttypid, a.atttypmod) AS data_type
        FROM pg_attribute a
        WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped
        "#,
    )
    .bind(table)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| -> std::result::Result<(String, String), sqlx::Error> {
            Ok((row.try_get("name")?, row.try_get("data_type")?))
        })
        .collect()
}

/// `INSERT ... ON CONFLICT ... RETURNING` for `rows` rows of `columns`
fn upsert_sql(
    table: &str,
    key: &str,
    columns: &[&str],
    column_types: &HashMap<String, String>,
    rows: usize,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut param = 0;
    let values = (0..rows)
        .map(|_| {
            let row = columns
                .iter()
                .map(|c| {
                    param += 1;
                    let ty = column_types.get(*c).map(String::as_str).unwrap_or("text");
                    format!("CAST(${} AS {})", param, ty)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", row)
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != key)
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    if updates.is_empty() {
        updates.push(format!("{0} = EXCLUDED.{0}", quote_ident(key)));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        table,
        column_list,
        values,
        quote_ident(key),
        updates.join(", ")
    )
}

#[async_trait]
impl UpstreamReader for PgWarehouse {
    async fn read_table(&self, layer: Layer, entity: &str) -> Result<Vec<Record>> {
        let store = self.store(layer)?;
        let table = qualified(&store.schema, entity);
        let read_error = |e: sqlx::Error| EtlError::from_read(format!("{}.{}", layer, entity), e);

        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&table)
            .fetch_one(&store.pool)
            .await
            .map_err(read_error)?;
        if exists.is_none() {
            debug!(layer = %layer, entity, "Upstream table missing, reading as empty");
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!("SELECT * FROM {}", table))
            .fetch_all(&store.pool)
            .await
            .map_err(read_error)?;

        let mut records = rows
            .iter()
            .map(|row| row_to_record(row).map_err(read_error))
            .collect::<Result<Vec<_>>>()?;

        let key: Option<String> = sqlx::query_scalar(
            "SELECT a.attname::text FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = to_regclass($1)::oid AND i.indisprimary LIMIT 1",
        )
        .bind(&table)
        .fetch_optional(&store.pool)
        .await
        .map_err(read_error)?;
        if let Some(key) = key {
            sort_by_key(&mut records, &key);
        }
        Ok(records)
    }
}
