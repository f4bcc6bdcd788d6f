//! Entity registry
//!
//! Declares, per layer, which entities exist, where their input comes from, how they
//! are transformed and how they are written. Built once at startup.

pub mod bronze;
pub mod gold;
pub mod silver;

use std::sync::Arc;

use crate::models::{Layer, LayerTarget};
use crate::runner::{LayerRunner, LayerStep};
use crate::sink::{MergeSink, UpstreamReader};

pub use bronze::BronzeSources;

pub struct LayerRegistry {
    runners: Vec<Arc<LayerRunner>>,
}

impl LayerRegistry {
    /// Register the three layers against one warehouse
    pub fn new(
        sources: BronzeSources,
        sink: Arc<dyn MergeSink>,
        reader: Arc<dyn UpstreamReader>,
    ) -> Self {
        Self {
            runners: vec![
                Arc::new(bronze::runner(sources, sink.clone(), reader.clone())),
                Arc::new(silver::runner(sink.clone(), reader.clone())),
                Arc::new(gold::runner(sink, reader)),
            ],
        }
    }

    /// Silver and gold only, for runs that never touch the sources
    pub fn downstream(sink: Arc<dyn MergeSink>, reader: Arc<dyn UpstreamReader>) -> Self {
        Self {
            runners: vec![
                Arc::new(silver::runner(sink.clone(), reader.clone())),
                Arc::new(gold::runner(sink, reader)),
            ],
        }
    }

    /// Runners in execution order
    pub fn steps(&self) -> Vec<Arc<dyn LayerStep>> {
        self.runners
            .iter()
            .map(|runner| runner.clone() as Arc<dyn LayerStep>)
            .collect()
    }

    pub fn targets(&self, layer: Layer) -> Vec<LayerTarget> {
        self.runners
            .iter()
            .filter(|runner| runner.layer() == layer)
            .flat_map(|runner| runner.targets().copied().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extract::{Extractor, RecordStream};
    use crate::models::{MergeKey, WriteMode};
    use crate::sink::MemoryWarehouse;
    use futures::{stream, StreamExt};

    struct NoRecords;

    impl Extractor for NoRecords {
        fn entity(&self) -> &str {
            "none"
        }

        fn extract(&self) -> RecordStream<'_> {
            stream::empty().boxed()
        }
    }

    fn registry() -> LayerRegistry {
        let source: Arc<dyn Extractor> = Arc::new(NoRecords);
        let warehouse = Arc::new(MemoryWarehouse::new());
        LayerRegistry::new(
            BronzeSources {
                products: source.clone(),
                customers: source.clone(),
                stock: source.clone(),
                sales: source,
            },
            warehouse.clone(),
            warehouse,
        )
    }

    #[test]
    fn test_steps_are_in_layer_order() {
        let layers: Vec<Layer> = registry().steps().iter().map(|s| s.layer()).collect();
        assert_eq!(layers, Layer::ALL.to_vec());
    }

    #[test]
    fn test_downstream_registry_has_no_bronze() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let registry = LayerRegistry::downstream(warehouse.clone(), warehouse);

        let layers: Vec<Layer> = registry.steps().iter().map(|s| s.layer()).collect();
        assert_eq!(layers, vec![Layer::Silver, Layer::Gold]);
        assert!(registry.targets(Layer::Bronze).is_empty());
    }

    #[test]
    fn test_bronze_targets_replace_keyed_on_content_hash() {
        let targets = registry().targets(Layer::Bronze);
        let entities: Vec<_> = targets.iter().map(|t| t.entity).collect();

        assert_eq!(entities, vec!["products", "customers", "stock", "sales"]);
        assert!(targets
            .iter()
            .all(|t| t.mode == WriteMode::Replace && t.key == MergeKey::ContentHash));
    }

    #[test]
    fn test_gold_unsold_products_replaces() {
        let targets = registry().targets(Layer::Gold);
        let unsold = targets.iter().find(|t| t.entity == "unsold_products").unwrap();
        assert_eq!(unsold.mode, WriteMode::Replace);
        assert_eq!(unsold.key, MergeKey::Natural("product_id"));
    }
}
