//! Silver layer: typed, deduplicated copies of the bronze entities
//!
//! Each entity is re-keyed on its business key and the bronze `_hash_key` is dropped.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use medallion_common::{canonical_value, Record, Value, HASH_KEY_FIELD};
use std::collections::HashSet;
use std::sync::Arc;

use super::bronze;
use crate::error::{EtlError, Result};
use crate::models::{Layer, LayerTarget, MergeKey, WriteMode};
use crate::runner::{EntityPipeline, EntitySource, LayerRunner};
use crate::sink::{MergeSink, UpstreamReader};

pub const CUSTOMERS: LayerTarget = LayerTarget::new(
    Layer::Silver,
    "customers",
    WriteMode::Merge,
    MergeKey::Natural("customer_id"),
);
pub const PRODUCTS: LayerTarget = LayerTarget::new(
    Layer::Silver,
    "products",
    WriteMode::Merge,
    MergeKey::Natural("product_id"),
);
pub const SALES: LayerTarget =
    LayerTarget::new(Layer::Silver, "sales", WriteMode::Merge, MergeKey::Natural("sale_id"));
pub const STOCK: LayerTarget =
    LayerTarget::new(Layer::Silver, "stock", WriteMode::Merge, MergeKey::Natural("sku"));

const SALES_INTEGER_FIELDS: [&str; 4] = ["sale_id", "product_id", "customer_id", "quantity"];

/// Date layouts accepted for `birth_date`, tried in order
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

pub fn runner(sink: Arc<dyn MergeSink>, reader: Arc<dyn UpstreamReader>) -> LayerRunner {
    LayerRunner::new(Layer::Silver, sink, reader)
        .with_pipeline(EntityPipeline::new(CUSTOMERS, from_bronze(bronze::CUSTOMERS), |mut batch| {
            customers(batch.take(bronze::CUSTOMERS.entity))
        }))
        .with_pipeline(EntityPipeline::new(PRODUCTS, from_bronze(bronze::PRODUCTS), |mut batch| {
            products(batch.take(bronze::PRODUCTS.entity))
        }))
        .with_pipeline(EntityPipeline::new(SALES, from_bronze(bronze::SALES), |mut batch| {
            sales(batch.take(bronze::SALES.entity))
        }))
        .with_pipeline(EntityPipeline::new(STOCK, from_bronze(bronze::STOCK), |mut batch| {
            stock(batch.take(bronze::STOCK.entity))
        }))
}

fn from_bronze(target: LayerTarget) -> EntitySource {
    EntitySource::Upstream {
        layer: Layer::Bronze,
        tables: vec![target.entity],
    }
}

pub fn customers(rows: Vec<Record>) -> Result<Vec<Record>> {
    let mut out = dedupe_first(CUSTOMERS, rows)?;
    for record in &mut out {
        if let Some(Value::Text(region)) = record.get("region") {
            let region = capitalize(region);
            record.insert("region", region);
        }
        if let Some(value) = record.get("birth_date") {
            let date = coerce_date(value);
            record.insert("birth_date", date);
        }
    }
    Ok(out)
}

pub fn products(rows: Vec<Record>) -> Result<Vec<Record>> {
    let mut out = dedupe_first(PRODUCTS, rows)?;
    for record in &mut out {
        record.rename("sk_u", "sku");
        if let Some(Value::Text(category)) = record.get("category") {
            let category = capitalize(category);
            record.insert("category", category);
        }
    }
    Ok(out)
}

pub fn sales(rows: Vec<Record>) -> Result<Vec<Record>> {
    rows.into_iter()
        .map(|mut record| {
            record.remove(HASH_KEY_FIELD);
            require_key(&SALES, &record)?;

            if let Some(price) = record.get("price") {
                let price = to_float(&SALES, "price", price)?;
                record.insert("price", price);
            }
            for field in SALES_INTEGER_FIELDS {
                if let Some(value) = record.get(field) {
                    let value = to_int(&SALES, field, value)?;
                    record.insert(field, value);
                }
            }
            Ok(record)
        })
        .collect()
}

pub fn stock(rows: Vec<Record>) -> Result<Vec<Record>> {
    rows.into_iter()
        .map(|mut record| {
            record.remove(HASH_KEY_FIELD);
            record.remove("_id");
            require_key(&STOCK, &record)?;
            Ok(record)
        })
        .collect()
}

/// Drop the bronze hash and keep the first record per business key
fn dedupe_first(target: LayerTarget, rows: Vec<Record>) -> Result<Vec<Record>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());

    for mut record in rows {
        record.remove(HASH_KEY_FIELD);
        let key = canonical_value(require_key(&target, &record)?);
        if seen.insert(key) {
            out.push(record);
        }
    }
    Ok(out)
}

fn require_key<'a>(target: &LayerTarget, record: &'a Record) -> Result<&'a Value> {
    record
        .require(target.key.column())
        .map_err(|e| EtlError::transform(target.qualified_name(), e))
}

/// First character upper-cased, the rest lower-cased
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Best-effort date conversion; anything unparseable becomes null
pub fn coerce_date(value: &Value) -> Value {
    match value {
        Value::Date(date) => Value::Date(*date),
        Value::Timestamp(ts) => Value::Date(ts.date_naive()),
        Value::Text(text) => parse_date(text.trim()).map(Value::Date).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|ts| ts.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ts| ts.date())
        })
}

fn to_float(target: &LayerTarget, field: &str, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    value
        .as_f64()
        .map(Value::Float)
        .ok_or_else(|| conversion_error(target, field, "float", value))
}

fn to_int(target: &LayerTarget, field: &str, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    value
        .as_i64()
        .map(Value::Int)
        .ok_or_else(|| conversion_error(target, field, "integer", value))
}

fn conversion_error(target: &LayerTarget, field: &str, to: &str, value: &Value) -> EtlError {
    EtlError::transform(
        target.qualified_name(),
        format!("cannot convert {} value {:?} of '{}' to {}", value.kind(), value, field, to),
    )
}
