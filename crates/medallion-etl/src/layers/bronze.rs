//! Bronze layer: raw landing of every source entity
//!
//! Records are landed unchanged apart from the `_hash_key` stamped by the runner. Each run
//! replaces the landed contents with the current extraction, keyed on the hash so identical
//! records within one extraction collapse to a single row.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::extract::{Extractor, HttpJsonExtractor, MongoExtractor, PgTableExtractor};
use crate::models::{Layer, LayerTarget, MergeKey, WriteMode};
use crate::runner::{EntityPipeline, EntitySource, LayerRunner};
use crate::sink::{MergeSink, UpstreamReader};

pub const PRODUCTS: LayerTarget =
    LayerTarget::new(Layer::Bronze, "products", WriteMode::Replace, MergeKey::ContentHash);
pub const CUSTOMERS: LayerTarget =
    LayerTarget::new(Layer::Bronze, "customers", WriteMode::Replace, MergeKey::ContentHash);
pub const STOCK: LayerTarget =
    LayerTarget::new(Layer::Bronze, "stock", WriteMode::Replace, MergeKey::ContentHash);
pub const SALES: LayerTarget =
    LayerTarget::new(Layer::Bronze, "sales", WriteMode::Replace, MergeKey::ContentHash);

/// Extractors feeding the bronze entities
pub struct BronzeSources {
    pub products: Arc<dyn Extractor>,
    pub customers: Arc<dyn Extractor>,
    pub stock: Arc<dyn Extractor>,
    pub sales: Arc<dyn Extractor>,
}

impl BronzeSources {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate_sources()?;
        let sources = &config.sources;

        Ok(Self {
            products: Arc::new(HttpJsonExtractor::new(PRODUCTS.entity, &sources.products_url)?),
            customers: Arc::new(HttpJsonExtractor::new(CUSTOMERS.entity, &sources.customers_url)?),
            stock: Arc::new(MongoExtractor::new(
                STOCK.entity,
                &sources.mongodb_uri,
                &sources.mongodb_database,
                &sources.mongodb_collection,
            )),
            sales: Arc::new(PgTableExtractor::connect_lazy(
                SALES.entity,
                &sources.sales_database_url,
                &sources.sales_table,
                config.warehouse.connect_timeout(),
            )?),
        })
    }
}

pub fn runner(
    sources: BronzeSources,
    sink: Arc<dyn MergeSink>,
    reader: Arc<dyn UpstreamReader>,
) -> LayerRunner {
    [
        (PRODUCTS, sources.products),
        (CUSTOMERS, sources.customers),
        (STOCK, sources.stock),
        (SALES, sources.sales),
    ]
    .into_iter()
    .fold(LayerRunner::new(Layer::Bronze, sink, reader), |runner, (target, extractor)| {
        runner.with_pipeline(EntityPipeline::passthrough(target, EntitySource::Extract(extractor)))
    })
}
