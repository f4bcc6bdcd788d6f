//! Layer runner
//!
//! Runs the entity pipelines of one layer in declaration order: read the source, apply
//! the transform, stamp the content hash when the target is keyed on it, write. Every
//! entity is attempted; the first failure is returned once all have been tried.

use async_trait::async_trait;
use medallion_common::{content_hash, Record, HASH_KEY_FIELD};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

use crate::error::Result;
use crate::extract::{self, Extractor};
use crate::models::{Layer, LayerTarget, LoadSummary, MergeKey};
use crate::sink::{MergeSink, UpstreamReader};

/// Per-entity transform over the records read for it
pub type TransformFn = Arc<dyn Fn(SourceBatch) -> Result<Vec<Record>> + Send + Sync>;

/// Where an entity's input comes from
pub enum EntitySource {
    /// Raw records from an external source
    Extract(Arc<dyn Extractor>),
    /// Committed tables of an earlier layer
    Upstream {
        layer: Layer,
        tables: Vec<&'static str>,
    },
}

/// Input tables handed to a transform, by name
#[derive(Debug, Default)]
pub struct SourceBatch {
    tables: Vec<(String, Vec<Record>)>,
}

impl SourceBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, rows: Vec<Record>) -> Self {
        self.tables.push((name.into(), rows));
        self
    }

    /// Take the rows of `name`, empty when absent
    pub fn take(&mut self, name: &str) -> Vec<Record> {
        self.tables
            .iter_mut()
            .find(|(table, _)| table == name)
            .map(|(_, rows)| std::mem::take(rows))
            .unwrap_or_default()
    }

    /// Rows of every table, concatenated
    pub fn into_rows(self) -> Vec<Record> {
        self.tables.into_iter().flat_map(|(_, rows)| rows).collect()
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|(_, rows)| rows.len()).sum()
    }
}

/// Source, transform and target of one entity
pub struct EntityPipeline {
    pub target: LayerTarget,
    pub source: EntitySource,
    pub transform: TransformFn,
}

impl EntityPipeline {
    pub fn new(
        target: LayerTarget,
        source: EntitySource,
        transform: impl Fn(SourceBatch) -> Result<Vec<Record>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target,
            source,
            transform: Arc::new(transform),
        }
    }

    /// Pipeline that lands its input unchanged
    pub fn passthrough(target: LayerTarget, source: EntitySource) -> Self {
        Self::new(target, source, |batch| Ok(batch.into_rows()))
    }
}

/// Unit of work the orchestrator schedules
#[async_trait]
pub trait LayerStep: Send + Sync {
    fn layer(&self) -> Layer;

    async fn run(&self) -> Result<Vec<LoadSummary>>;
}

pub struct LayerRunner {
    layer: Layer,
    pipelines: Vec<EntityPipeline>,
    sink: Arc<dyn MergeSink>,
    reader: Arc<dyn UpstreamReader>,
}

impl LayerRunner {
    pub fn new(layer: Layer, sink: Arc<dyn MergeSink>, reader: Arc<dyn UpstreamReader>) -> Self {
        Self {
            layer,
            pipelines: Vec::new(),
            sink,
            reader,
        }
    }

    pub fn with_pipeline(mut self, pipeline: EntityPipeline) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn targets(&self) -> impl Iterator<Item = &LayerTarget> {
        self.pipelines.iter().map(|p| &p.target)
    }

    async fn read_source(&self, pipeline: &EntityPipeline) -> Result<SourceBatch> {
        match &pipeline.source {
            EntitySource::Extract(extractor) => {
                let rows = extract::collect(extractor.as_ref()).await?;
                Ok(SourceBatch::new().with_table(pipeline.target.entity, rows))
            },
            EntitySource::Upstream { layer, tables } => {
                let mut batch = SourceBatch::new();
                for table in tables {
                    let rows = self.reader.read_table(*layer, table).await?;
                    batch = batch.with_table(*table, rows);
                }
                Ok(batch)
            },
        }
    }

    #[instrument(skip(self, pipeline), fields(table = %pipeline.target.qualified_name()))]
    async fn run_entity(&self, pipeline: &EntityPipeline) -> Result<LoadSummary> {
        let started = Instant::now();
        let batch = self.read_source(pipeline).await?;
        let rows_read = batch.row_count();

        let mut records = (pipeline.transform)(batch)?;
        if pipeline.target.key == MergeKey::ContentHash {
            stamp_content_hash(&mut records);
        }

        let mut summary = self.sink.write(&pipeline.target, records).await?;
        summary.rows_read = rows_read;

        info!(
            rows_read = summary.rows_read,
            rows_written = summary.rows_written,
            inserted = summary.rows_inserted,
            updated = summary.rows_updated,
            removed = summary.rows_removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Entity loaded"
        );
        Ok(summary)
    }
}

#[async_trait]
impl LayerStep for LayerRunner {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn run(&self) -> Result<Vec<LoadSummary>> {
        info!(layer = %self.layer, entities = self.pipelines.len(), "Running layer");

        let mut summaries = Vec::with_capacity(self.pipelines.len());
        let mut first_error = None;

        for pipeline in &self.pipelines {
            match self.run_entity(pipeline).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    error!(
                        table = %pipeline.target.qualified_name(),
                        error = %e,
                        "Entity failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }
}

/// Set `_hash_key` on every record from its other fields
pub fn stamp_content_hash(records: &mut [Record]) {
    for record in records.iter_mut() {
        let hash = content_hash(record);
        record.insert(HASH_KEY_FIELD, hash);
    }
}
