//! Layer sinks
//!
//! A sink applies one batch of records to a target table, either by upserting on the
//! target's merge key or by replacing the whole table. Every write is atomic.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use medallion_common::{canonical_value, Record, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{EtlError, Result, WriteKind};
use crate::models::{Layer, LayerTarget, LoadSummary};

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// Idempotent writer for layer tables
#[async_trait]
pub trait MergeSink: Send + Sync {
    /// Apply `records` to `target` in one transaction
    async fn write(&self, target: &LayerTarget, records: Vec<Record>) -> Result<LoadSummary>;
}

/// Read access to the committed tables of a layer
#[async_trait]
pub trait UpstreamReader: Send + Sync {
    /// All rows of `layer.entity`, ordered by the table's merge key (see [`sort_by_key`])
    ///
    /// A table that does not exist yet reads as empty.
    async fn read_table(&self, layer: Layer, entity: &str) -> Result<Vec<Record>>;
}

/// Column type inferred from the values of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Numeric,
    Boolean,
    Text,
    Date,
    TimestampTz,
    Jsonb,
}

impl ColumnType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Jsonb => "JSONB",
        }
    }

    /// Type of a non-null value; `None` for null
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Int(_) => Some(ColumnType::BigInt),
            Value::Float(_) => Some(ColumnType::Double),
            Value::Decimal(_) => Some(ColumnType::Numeric),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::TimestampTz),
            Value::List(_) | Value::Map(_) => Some(ColumnType::Jsonb),
        }
    }

    /// Type declared by PostgreSQL's `format_type`; `None` for types never created here
    pub fn from_sql_name(name: &str) -> Option<Self> {
        match name {
            "bigint" => Some(ColumnType::BigInt),
            "double precision" => Some(ColumnType::Double),
            "boolean" => Some(ColumnType::Boolean),
            "text" => Some(ColumnType::Text),
            "date" => Some(ColumnType::Date),
            "timestamp with time zone" | "timestamptz" => Some(ColumnType::TimestampTz),
            "jsonb" => Some(ColumnType::Jsonb),
            n if n == "numeric" || n.starts_with("numeric(") => Some(ColumnType::Numeric),
            _ => None,
        }
    }

    /// Narrowest type holding values of both `self` and `other`
    ///
    /// Integers widen to doubles, any number with a decimal widens to `NUMERIC`, dates
    /// widen to timestamps and every other mix falls back to `TEXT`.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;

        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Double) | (Double, BigInt) => Double,
            (BigInt | Double, Numeric) | (Numeric, BigInt | Double) => Numeric,
            (Date, TimestampTz) | (TimestampTz, Date) => TimestampTz,
            _ => Text,
        }
    }
}

/// Columns of a batch in order of first appearance
///
/// Each column takes the [`ColumnType::widen`] of all its non-null values; all-null
/// columns are `TEXT`.
pub fn infer_columns(records: &[Record]) -> Vec<(String, ColumnType)> {
    let mut order: Vec<String> = Vec::new();
    let mut types: HashMap<String, Option<ColumnType>> = HashMap::new();

    for record in records {
        for (name, value) in record.iter() {
            let slot = types.entry(name.to_string()).or_insert_with(|| {
                order.push(name.to_string());
                None
            });
            if let Some(ty) = ColumnType::of(value) {
                *slot = Some(slot.map_or(ty, |current| current.widen(ty)));
            }
        }
    }

    order
        .into_iter()
        .map(|name| {
            let ty = types.get(&name).copied().flatten().unwrap_or(ColumnType::Text);
            (name, ty)
        })
        .collect()
}

/// Check merge keys and collapse duplicates to their last occurrence
///
/// Each surviving record keeps the position of the first occurrence of its key.
pub fn prepare_batch(target: &LayerTarget, records: Vec<Record>) -> Result<Vec<Record>> {
    let key = target.key.column();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut batch: Vec<Record> = Vec::with_capacity(records.len());

    for (row, record) in records.into_iter().enumerate() {
        let key_value = match record.get(key) {
            Some(value) if !value.is_null() => canonical_value(value),
            _ => {
                return Err(EtlError::write(
                    target.qualified_name(),
                    WriteKind::Constraint,
                    format!("record {} has no value for merge key '{}'", row, key),
                ))
            },
        };

        match positions.get(&key_value) {
            Some(&pos) => batch[pos] = record,
            None => {
                positions.insert(key_value, batch.len());
                batch.push(record);
            },
        }
    }

    Ok(batch)
}

/// Order rows by their `key` column
///
/// Numeric keys compare numerically and sort before non-numeric ones, which compare by
/// canonical form. Both warehouses return upstream rows in this order.
pub fn sort_by_key(rows: &mut [Record], key: &str) {
    rows.sort_by(|a, b| match (a.get(key), b.get(key)) {
        (Some(x), Some(y)) => compare_keys(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    let number = |v: &Value| match v {
        Value::Int(_) | Value::Float(_) | Value::Decimal(_) => v.as_f64(),
        _ => None,
    };

    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => canonical_value(a).cmp(&canonical_value(b)),
    }
}
