//! Decoding of PostgreSQL rows into records
//!
//! Shared by the sales extractor and the warehouse reader. Columns are decoded by their
//! server-side type name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use medallion_common::{Record, Value};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Column, Row, TypeInfo};

pub fn row_to_record(row: &PgRow) -> Result<Record, sqlx::Error> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name())?;
        record.insert(column.name(), value);
    }
    Ok(record)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from).into(),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(idx)?
            .map(|d| Value::Decimal(d.normalized().to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|ts| ts.and_utc())
            .into(),
        "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(idx)?.into(),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(Value::from_json)
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)?
            .map(|id| id.to_string())
            .into(),
        // TEXT, VARCHAR, BPCHAR, NAME and anything else with a textual decoding
        _ => row.try_get::<Option<String>, _>(idx)?.into(),
    };
    Ok(value)
}
