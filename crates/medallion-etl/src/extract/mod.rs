//! Bronze-layer extractors
//!
//! Each extractor yields the raw records of one source entity as a lazy stream. Nothing
//! is fetched until the stream is polled.

pub mod http;
pub mod mongo;
pub mod postgres;
pub mod rows;

use futures::stream::BoxStream;
use futures::TryStreamExt;
use medallion_common::Record;

use crate::error::Result;

pub use http::HttpJsonExtractor;
pub use mongo::MongoExtractor;
pub use postgres::PgTableExtractor;

/// Lazy sequence of extracted records
pub type RecordStream<'a> = BoxStream<'a, Result<Record>>;

/// Source of raw records for one entity
pub trait Extractor: Send + Sync {
    /// Entity name used in errors and logs
    fn entity(&self) -> &str;

    fn extract(&self) -> RecordStream<'_>;
}

/// Drain an extractor into memory
pub async fn collect(extractor: &dyn Extractor) -> Result<Vec<Record>> {
    extractor.extract().try_collect().await
}
