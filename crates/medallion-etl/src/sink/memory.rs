//! In-process warehouse with the same write semantics as [`super::PgWarehouse`]

use async_trait::async_trait;
use medallion_common::{canonical_value, Record, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{infer_columns, prepare_batch, sort_by_key, MergeSink, UpstreamReader};
use crate::error::Result;
use crate::models::{Layer, LayerTarget, LoadSummary, TargetStatus, WriteMode};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Record>,
    index: HashMap<String, usize>,
    /// Merge key of the last write; seeded tables have none
    key: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<(Layer, String), Table>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current rows of a table, in insertion order
    pub async fn rows(&self, layer: Layer, entity: &str) -> Vec<Record> {
        self.tables
            .lock()
            .await
            .get(&(layer, entity.to_string()))
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// Seed a table directly, bypassing merge semantics
    pub async fn seed(&self, layer: Layer, entity: &str, rows: Vec<Record>) {
        let table = Table {
            rows,
            ..Table::default()
        };
        self.tables.lock().await.insert((layer, entity.to_string()), table);
    }
}

#[async_trait]
impl MergeSink for MemoryWarehouse {
    async fn write(&self, target: &LayerTarget, records: Vec<Record>) -> Result<LoadSummary> {
        let mut summary = LoadSummary::new(target, records.len());
        let batch = prepare_batch(target, records)?;
        let key = target.key.column();
        let columns: Vec<String> = infer_columns(&batch).into_iter().map(|(name, _)| name).collect();

        let mut tables = self.tables.lock().await;
        let table = tables
            .entry((target.layer, target.entity.to_string()))
            .or_default();
        table.key = Some(key);

        if target.mode == WriteMode::Replace {
            summary.rows_removed = table.rows.len();
            table.rows.clear();
            table.index.clear();
        } else if table.index.len() != table.rows.len() {
            table.index = table
                .rows
                .iter()
                .enumerate()
                .filter_map(|(pos, row)| row.get(key).map(|v| (canonical_value(v), pos)))
                .collect();
        }

        // New columns read as Null on rows written before them
        for row in table.rows.iter_mut() {
            for column in &columns {
                if !row.contains(column) {
                    row.insert(column.as_str(), Value::Null);
                }
            }
        }

        for mut record in batch {
            // prepare_batch guarantees the key is present
            let key_value = record.get(key).map(canonical_value).unwrap_or_default();
            match table.index.get(&key_value) {
                Some(&pos) => {
                    // Like ON CONFLICT DO UPDATE: every batch column is set, others are kept
                    let row = &mut table.rows[pos];
                    for column in columns.iter().filter(|c| c.as_str() != key) {
                        row.insert(column.as_str(), record.remove(column).unwrap_or(Value::Null));
                    }
                    summary.rows_updated += 1;
                },
                None => {
                    for column in &columns {
                        if !record.contains(column) {
                            record.insert(column.as_str(), Value::Null);
                        }
                    }
                    table.index.insert(key_value, table.rows.len());
                    table.rows.push(record);
                    summary.rows_inserted += 1;
                },
            }
        }

        summary.rows_written = summary.rows_inserted + summary.rows_updated;
        if summary.rows_written > 0 {
            summary.status = TargetStatus::Loaded;
        }
        Ok(summary)
    }
}

#[async_trait]
impl UpstreamReader for MemoryWarehouse {
    async fn read_table(&self, layer: Layer, entity: &str) -> Result<Vec<Record>> {
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(&(layer, entity.to_string())) else {
            return Ok(Vec::new());
        };

        let mut rows = table.rows.clone();
        if let Some(key) = table.key {
            sort_by_key(&mut rows, key);
        }
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::MergeKey;
    use medallion_common::Value;

    const STOCK: LayerTarget =
        LayerTarget::new(Layer::Gold, "stock", WriteMode::Merge, MergeKey::Natural("sku"));
    const UNSOLD: LayerTarget = LayerTarget::new(
        Layer::Gold,
        "unsold_products",
        WriteMode::Replace,
        MergeKey::Natural("product_id"),
    );

    #[tokio::test]
    async fn test_merge_counts_inserts_and_updates() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write(&STOCK, vec![Record::new().with("sku", "A").with("available", 5)])
            .await
            .unwrap();

        let summary = warehouse
            .write(
                &STOCK,
                vec![
                    Record::new().with("sku", "A").with("available", 4),
                    Record::new().with("sku", "B").with("available", 9),
                ],
            )
            .await
            .unwrap();

        assert_eq!((summary.rows_inserted, summary.rows_updated), (1, 1));
        let rows = warehouse.rows(Layer::Gold, "stock").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("available"), Some(&Value::Int(4)));
    }

    #[tokio::test]
    async fn test_merge_keeps_columns_absent_from_batch() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write(
                &STOCK,
                vec![Record::new().with("sku", "A").with("available", 5).with("amount", 2)],
            )
            .await
            .unwrap();

        warehouse
            .write(
                &STOCK,
                vec![
                    Record::new().with("sku", "A").with("available", 3),
                    Record::new().with("sku", "B").with("available", 1),
                    Record::new().with("sku", "C").with("location", "north"),
                ],
            )
            .await
            .unwrap();

        let rows = warehouse.rows(Layer::Gold, "stock").await;
        assert_eq!(rows[0].get("available"), Some(&Value::Int(3)));
        assert_eq!(rows[0].get("amount"), Some(&Value::Int(2)));
        assert_eq!(rows[0].get("location"), Some(&Value::Null));
        assert_eq!(rows[2].get("available"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_read_table_is_ordered_by_merge_key() {
        let warehouse = MemoryWarehouse::new();
        let sale = |id: i64| Record::new().with("sale_id", id);
        let sales =
            LayerTarget::new(Layer::Silver, "sales", WriteMode::Merge, MergeKey::Natural("sale_id"));
        warehouse.write(&sales, vec![sale(10), sale(2)]).await.unwrap();
        warehouse.write(&sales, vec![sale(7), sale(2)]).await.unwrap();

        let ids: Vec<_> = warehouse
            .read_table(Layer::Silver, "sales")
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.get("sale_id").and_then(Value::as_i64))
            .collect();
        assert_eq!(ids, vec![2, 7, 10]);
    }

    #[tokio::test]
    async fn test_replace_discards_previous_rows() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write(
                &UNSOLD,
                vec![
                    Record::new().with("product_id", 1),
                    Record::new().with("product_id", 2),
                ],
            )
            .await
            .unwrap();

        let summary = warehouse
            .write(&UNSOLD, vec![Record::new().with("product_id", 3)])
            .await
            .unwrap();

        assert_eq!(summary.rows_removed, 2);
        let rows = warehouse.rows(Layer::Gold, "unsold_products").await;
        assert_eq!(rows, vec![Record::new().with("product_id", 3)]);
    }

    #[tokio::test]
    async fn test_empty_replace_truncates() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write(&UNSOLD, vec![Record::new().with("product_id", 1)])
            .await
            .unwrap();

        let summary = warehouse.write(&UNSOLD, Vec::new()).await.unwrap();
        assert_eq!(summary.status, TargetStatus::Empty);
        assert!(warehouse.rows(Layer::Gold, "unsold_products").await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_table_untouched() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write(&STOCK, vec![Record::new().with("sku", "A")])
            .await
            .unwrap();

        let result = warehouse
            .write(&STOCK, vec![Record::new().with("sku", "B"), Record::new().with("qty", 1)])
            .await;

        assert!(result.is_err());
        assert_eq!(warehouse.rows(Layer::Gold, "stock").await.len(), 1);
    }
}
