//! PostgreSQL warehouse and execution log tests
//!
//! Require Docker; run with `cargo test -- --ignored`.
//!
//! Covers:
//! - merge insert/update counts and idempotent reloads
//! - replace discarding previous contents
//! - columns added by later batches
//! - integer columns widened when floats arrive
//! - reads ordered by the merge key
//! - reading a table that was never written
//! - execution log append and recent ordering

use anyhow::Result;
use medallion_common::{Record, Value};
use medallion_etl::execution_log::{
    ExecutionLog, ExecutionLogEntry, ExecutionStatus, PgExecutionLog,
};
use medallion_etl::sink::{MergeSink, PgWarehouse, UpstreamReader};
use medallion_etl::{Layer, LayerTarget, MergeKey, WriteMode};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

const SILVER_SALES: LayerTarget =
    LayerTarget::new(Layer::Silver, "sales", WriteMode::Merge, MergeKey::Natural("sale_id"));
const GOLD_UNSOLD: LayerTarget = LayerTarget::new(
    Layer::Gold,
    "unsold_products",
    WriteMode::Replace,
    MergeKey::Natural("product_id"),
);

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,medallion_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let conn_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&conn_string)
        .await?;

    Ok((container, pool))
}

fn sale(id: i64, quantity: i64, price: f64) -> Record {
    Record::new()
        .with("sale_id", id)
        .with("quantity", quantity)
        .with("price", price)
}

fn sorted_by(mut rows: Vec<Record>, key: &str) -> Vec<Record> {
    rows.sort_by_key(|r| r.get(key).and_then(Value::as_i64));
    rows
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_merge_counts_inserts_and_updates() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);

    let first = warehouse
        .write(&SILVER_SALES, vec![sale(1, 2, 10.0), sale(2, 1, 5.5)])
        .await?;
    assert_eq!((first.rows_inserted, first.rows_updated), (2, 0));

    let second = warehouse
        .write(&SILVER_SALES, vec![sale(2, 4, 5.5), sale(3, 1, 7.25)])
        .await?;
    info!(?second, "Second merge");
    assert_eq!((second.rows_inserted, second.rows_updated), (1, 1));

    let rows = sorted_by(warehouse.read_table(Layer::Silver, "sales").await?, "sale_id");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].get("quantity"), Some(&Value::Int(4)));
    assert_eq!(rows[2].get("price"), Some(&Value::Float(7.25)));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_reloading_same_batch_keeps_row_count() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);
    let batch = vec![sale(1, 2, 10.0), sale(2, 1, 5.5)];

    warehouse.write(&SILVER_SALES, batch.clone()).await?;
    let reload = warehouse.write(&SILVER_SALES, batch).await?;

    assert_eq!(reload.rows_inserted, 0);
    assert_eq!(reload.rows_updated, 2);
    assert_eq!(warehouse.read_table(Layer::Silver, "sales").await?.len(), 2);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_replace_discards_previous_rows() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);
    let product = |id: i64| Record::new().with("product_id", id).with("product", format!("P{}", id));

    warehouse
        .write(&GOLD_UNSOLD, vec![product(1), product(2), product(3)])
        .await?;
    let summary = warehouse.write(&GOLD_UNSOLD, vec![product(3)]).await?;

    assert_eq!(summary.rows_removed, 3);
    assert_eq!(summary.rows_inserted, 1);
    let rows = warehouse.read_table(Layer::Gold, "unsold_products").await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("product_id"), Some(&Value::Int(3)));

    let emptied = warehouse.write(&GOLD_UNSOLD, Vec::new()).await?;
    assert_eq!(emptied.rows_removed, 1);
    assert!(warehouse.read_table(Layer::Gold, "unsold_products").await?.is_empty());

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_new_columns_are_added() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);

    warehouse.write(&SILVER_SALES, vec![sale(1, 2, 10.0)]).await?;
    warehouse
        .write(&SILVER_SALES, vec![sale(2, 1, 3.0).with("sale_date", "2024-02-01")])
        .await?;

    let rows = sorted_by(warehouse.read_table(Layer::Silver, "sales").await?, "sale_id");
    assert_eq!(rows[0].get("sale_date"), Some(&Value::Null));
    assert_eq!(rows[1].get("sale_date").and_then(Value::as_str), Some("2024-02-01"));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_mixed_numeric_batch_loads_as_double() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);
    let priced = |id: i64, price: Value| Record::new().with("sale_id", id).with("price", price);

    warehouse
        .write(&SILVER_SALES, vec![priced(1, Value::Int(899)), priced(2, Value::Float(1299.9))])
        .await?;

    let rows = warehouse.read_table(Layer::Silver, "sales").await?;
    assert_eq!(rows[0].get("price"), Some(&Value::Float(899.0)));
    assert_eq!(rows[1].get("price"), Some(&Value::Float(1299.9)));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_integer_column_is_widened_by_later_floats() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool.clone());
    let priced = |id: i64, price: Value| Record::new().with("sale_id", id).with("price", price);

    warehouse
        .write(&SILVER_SALES, vec![priced(1, Value::Int(899)), priced(2, Value::Int(450))])
        .await?;
    let summary = warehouse
        .write(&SILVER_SALES, vec![priced(2, Value::Float(449.5)), priced(3, Value::Float(12.25))])
        .await?;
    assert_eq!((summary.rows_inserted, summary.rows_updated), (1, 1));

    let declared: String = sqlx::query_scalar(
        "SELECT data_type FROM information_schema.columns \
         WHERE table_schema = 'silver' AND table_name = 'sales' AND column_name = 'price'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(declared, "double precision");

    let rows = warehouse.read_table(Layer::Silver, "sales").await?;
    let prices: Vec<_> = rows.iter().filter_map(|r| r.get("price").cloned()).collect();
    assert_eq!(prices, vec![Value::Float(899.0), Value::Float(449.5), Value::Float(12.25)]);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_reads_are_ordered_by_merge_key() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);

    warehouse
        .write(&SILVER_SALES, vec![sale(10, 1, 1.0), sale(2, 1, 1.0)])
        .await?;
    warehouse
        .write(&SILVER_SALES, vec![sale(7, 1, 1.0), sale(2, 5, 1.0)])
        .await?;

    let ids: Vec<_> = warehouse
        .read_table(Layer::Silver, "sales")
        .await?
        .iter()
        .filter_map(|r| r.get("sale_id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids, vec![2, 7, 10]);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_missing_table_reads_as_empty() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let warehouse = PgWarehouse::single_pool(pool);

    assert!(warehouse.read_table(Layer::Bronze, "products").await?.is_empty());

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_execution_log_returns_newest_first() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let log = PgExecutionLog::new(pool.clone(), "public");

    log.append(&ExecutionLogEntry::new("pipeline_bronze", ExecutionStatus::Success, "ok"))
        .await?;
    log.append(&ExecutionLogEntry::new(
        "pipeline_silver",
        ExecutionStatus::Error,
        "Pipeline Silver failed: boom",
    ))
    .await?;

    let recent = log.recent(10).await?;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].step, "pipeline_silver");
    assert_eq!(recent[0].status, ExecutionStatus::Error);
    assert_eq!(recent[1].step, "pipeline_bronze");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM public.log_execution")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);

    Ok(())
}
