//! Gold layer: reporting tables derived from committed silver data
//!
//! Joins are equi-joins on canonical value keys; null keys never match. Aggregates
//! follow SQL semantics: `SUM` skips nulls and is null over an all-null group, and
//! arithmetic with a null operand yields null.

use medallion_common::{canonical_value, Record, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::silver;
use crate::error::{EtlError, Result};
use crate::models::{Layer, LayerTarget, MergeKey, WriteMode};
use crate::runner::{EntityPipeline, EntitySource, LayerRunner};
use crate::sink::{MergeSink, UpstreamReader};

pub const UNSOLD_PRODUCTS: LayerTarget = LayerTarget::new(
    Layer::Gold,
    "unsold_products",
    WriteMode::Replace,
    MergeKey::Natural("product_id"),
);
pub const STOCK: LayerTarget =
    LayerTarget::new(Layer::Gold, "stock", WriteMode::Merge, MergeKey::Natural("sku"));
pub const SALES: LayerTarget =
    LayerTarget::new(Layer::Gold, "sales", WriteMode::Merge, MergeKey::Natural("sale_id"));

const PRODUCT_FIELDS: [&str; 6] = ["sku", "product_id", "product", "category", "brand", "model_year"];

static NULL: Value = Value::Null;

pub fn runner(sink: Arc<dyn MergeSink>, reader: Arc<dyn UpstreamReader>) -> LayerRunner {
    LayerRunner::new(Layer::Gold, sink, reader)
        .with_pipeline(EntityPipeline::new(
            UNSOLD_PRODUCTS,
            from_silver(&[silver::SALES, silver::PRODUCTS]),
            |mut batch| {
                Ok(unsold_products(
                    &batch.take(silver::SALES.entity),
                    &batch.take(silver::PRODUCTS.entity),
                ))
            },
        ))
        .with_pipeline(EntityPipeline::new(
            STOCK,
            from_silver(&[silver::SALES, silver::PRODUCTS, silver::STOCK]),
            |mut batch| {
                stock(
                    &batch.take(silver::SALES.entity),
                    &batch.take(silver::PRODUCTS.entity),
                    &batch.take(silver::STOCK.entity),
                )
            },
        ))
        .with_pipeline(EntityPipeline::new(
            SALES,
            from_silver(&[silver::SALES, silver::CUSTOMERS, silver::PRODUCTS]),
            |mut batch| {
                sales(
                    &batch.take(silver::SALES.entity),
                    &batch.take(silver::CUSTOMERS.entity),
                    &batch.take(silver::PRODUCTS.entity),
                )
            },
        ))
}

fn from_silver(targets: &[LayerTarget]) -> EntitySource {
    EntitySource::Upstream {
        layer: Layer::Silver,
        tables: targets.iter().map(|t| t.entity).collect(),
    }
}

/// Distinct products that appear in no sale
pub fn unsold_products(sales: &[Record], products: &[Record]) -> Vec<Record> {
    let sold: HashSet<String> = sales.iter().filter_map(|s| join_key(s, "product_id")).collect();
    let mut seen = HashSet::new();

    products
        .iter()
        .filter(|p| matches!(join_key(p, "product_id"), Some(id) if !sold.contains(&id)))
        .map(|p| p.project(&PRODUCT_FIELDS))
        .filter(|row| seen.insert(canonical_value(&Value::Map(row.clone()))))
        .collect()
}

/// Units sold per product against the stock on hand for its sku
pub fn stock(sales: &[Record], products: &[Record], stock: &[Record]) -> Result<Vec<Record>> {
    let products_by_id = index_by(products, "product_id");
    let stock_by_sku = index_by(stock, "sku");

    // product_id -> (product, quantities), in order of first sale
    let mut order: Vec<String> = Vec::new();
    let mut sold: HashMap<String, (&Record, Vec<&Value>)> = HashMap::new();
    for sale in sales {
        let Some(product_id) = join_key(sale, "product_id") else { continue };
        let Some(product) = products_by_id.get(&product_id) else { continue };
        let quantity = sale.get("quantity").unwrap_or(&NULL);

        sold.entry(product_id.clone())
            .or_insert_with(|| {
                order.push(product_id);
                (*product, Vec::new())
            })
            .1
            .push(quantity);
    }

    let mut out = Vec::with_capacity(order.len());
    for product_id in order {
        let Some((product, quantities)) = sold.remove(&product_id) else { continue };
        let Some(sku) = join_key(product, "sku") else { continue };
        let Some(stock_row) = stock_by_sku.get(&sku) else { continue };

        let amount = sum(&STOCK, "quantity", &quantities)?;
        let current_stock = stock_row.get("current_stock").cloned().unwrap_or(Value::Null);
        let available = arithmetic(&STOCK, "available", &current_stock, &amount, Op::Sub)?;

        let mut row = product.project(&PRODUCT_FIELDS);
        row.insert("amount", amount);
        row.insert("current_stock", current_stock);
        row.insert("available", available);
        out.push(row);
    }
    Ok(out)
}

/// Sales enriched with customer and product attributes
pub fn sales(sales: &[Record], customers: &[Record], products: &[Record]) -> Result<Vec<Record>> {
    let customers_by_id = index_by(customers, "customer_id");
    let products_by_id = index_by(products, "product_id");
    let mut out = Vec::with_capacity(sales.len());

    for sale in sales {
        let customer = join_key(sale, "customer_id").and_then(|id| customers_by_id.get(&id));
        let product = join_key(sale, "product_id").and_then(|id| products_by_id.get(&id));
        let (Some(&customer), Some(&product)) = (customer, product) else { continue };

        let field = |record: &Record, name: &str| record.get(name).cloned().unwrap_or(Value::Null);
        let quantity = field(sale, "quantity");
        let price = field(sale, "price");
        let amount = arithmetic(&SALES, "amount", &quantity, &price, Op::Mul)?;

        out.push(
            Record::new()
                .with("sale_id", field(sale, "sale_id"))
                .with("customer_id", field(customer, "customer_id"))
                .with("customer", field(customer, "customer"))
                .with("gender", field(customer, "gender"))
                .with("region", field(customer, "region"))
                .with("sku", field(product, "sku"))
                .with("product_id", field(sale, "product_id"))
                .with("product", field(product, "product"))
                .with("category", field(product, "category"))
                .with("sub_category", field(product, "sub_category"))
                .with("brand", field(product, "brand"))
                .with("model_year", field(product, "model_year"))
                .with("quantity", quantity)
                .with("price", price)
                .with("amount", amount)
                .with("sale_date", field(sale, "sale_date")),
        );
    }
    Ok(out)
}

/// Canonical key of a field, `None` when absent or null
fn join_key(record: &Record, field: &str) -> Option<String> {
    record
        .get(field)
        .filter(|v| !v.is_null())
        .map(canonical_value)
}

/// First record per join key
fn index_by<'a>(records: &'a [Record], field: &str) -> HashMap<String, &'a Record> {
    let mut index = HashMap::new();
    for record in records {
        if let Some(key) = join_key(record, field) {
            index.entry(key).or_insert(record);
        }
    }
    index
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
}

fn arithmetic(target: &LayerTarget, field: &str, a: &Value, b: &Value, op: Op) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }

    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        let exact = match op {
            Op::Add => x.checked_add(*y),
            Op::Sub => x.checked_sub(*y),
            Op::Mul => x.checked_mul(*y),
        };
        if let Some(v) = exact {
            return Ok(Value::Int(v));
        }
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
        })),
        _ => Err(EtlError::transform(
            target.qualified_name(),
            format!("'{}' needs numeric operands, got {} and {}", field, a.kind(), b.kind()),
        )),
    }
}

fn sum(target: &LayerTarget, field: &str, values: &[&Value]) -> Result<Value> {
    values
        .iter()
        .filter(|v| !v.is_null())
        .try_fold(Value::Null, |acc, v| match acc {
            Value::Null => arithmetic(target, field, &Value::Int(0), v, Op::Add),
            acc => arithmetic(target, field, &acc, v, Op::Add),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn product(id: i64, sku: &str) -> Record {
        Record::new()
            .with("product_id", id)
            .with("sku", sku)
            .with("product", format!("Product {}", id))
            .with("category", "Phones")
            .with("sub_category", "Android")
            .with("brand", "Acme")
            .with("model_year", 2023)
    }

    fn sale(id: i64, customer_id: i64, product_id: i64, quantity: i64, price: f64) -> Record {
        Record::new()
            .with("sale_id", id)
            .with("customer_id", customer_id)
            .with("product_id", product_id)
            .with("quantity", quantity)
            .with("price", price)
            .with("sale_date", "2024-03-01")
    }

    #[test]
    fn test_unsold_products() {
        let products = vec![product(1, "A"), product(2, "B"), product(3, "C")];
        let sales = vec![sale(10, 1, 1, 2, 5.0), sale(11, 1, 3, 1, 5.0)];

        let out = unsold_products(&sales, &products);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("product_id"), Some(&Value::Int(2)));
        let names: Vec<_> = out[0].field_names().collect();
        assert_eq!(names, PRODUCT_FIELDS.to_vec());
    }

    #[test]
    fn test_stock_sums_quantities_against_current_stock() {
        let products = vec![product(1, "A"), product(2, "B")];
        let sales = vec![
            sale(10, 1, 1, 2, 5.0),
            sale(11, 2, 1, 3, 5.0),
            sale(12, 2, 2, 1, 9.0),
        ];
        let stock_rows = vec![
            Record::new().with("sku", "A").with("current_stock", 20),
            Record::new().with("sku", "Z").with("current_stock", 7),
        ];

        let out = stock(&sales, &products, &stock_rows).unwrap();

        // B has no stock row and drops out of the inner join
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("sku").and_then(Value::as_str), Some("A"));
        assert_eq!(out[0].get("amount"), Some(&Value::Int(5)));
        assert_eq!(out[0].get("available"), Some(&Value::Int(15)));
    }

    #[test]
    fn test_sum_skips_nulls() {
        let quantities = [&Value::Null, &Value::Int(2), &Value::Float(1.5)];
        assert_eq!(sum(&STOCK, "quantity", &quantities).unwrap(), Value::Float(3.5));
        assert_eq!(sum(&STOCK, "quantity", &[&Value::Null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_sales_inner_join_and_amount() {
        let customers = vec![Record::new()
            .with("customer_id", 1)
            .with("customer", "Ana")
            .with("gender", "F")
            .with("region", "Northeast")];
        let products = vec![product(1, "A")];
        let sales_rows = vec![sale(10, 1, 1, 3, 2.5), sale(11, 99, 1, 1, 1.0)];

        let out = sales(&sales_rows, &customers, &products).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("customer").and_then(Value::as_str), Some("Ana"));
        assert_eq!(out[0].get("amount"), Some(&Value::Float(7.5)));
        assert_eq!(out[0].len(), 16);
    }

    #[test]
    fn test_non_numeric_amount_is_transform_failure() {
        let a = Value::Text("three".into());
        let err = arithmetic(&SALES, "amount", &a, &Value::Int(2), Op::Mul).unwrap_err();
        assert!(matches!(err, EtlError::Transform { .. }));
    }
}
