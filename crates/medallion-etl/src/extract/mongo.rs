//! MongoDB collection extractor
//!
//! A client is opened per extraction and dropped with the stream. `ObjectId`s are
//! rendered as hex strings.

use chrono::DateTime;
use futures::{stream, StreamExt, TryStreamExt};
use medallion_common::{Record, Value};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::{Client, Cursor};
use tracing::info;

use super::{Extractor, RecordStream};
use crate::error::{EtlError, ExtractKind, Result};

pub struct MongoExtractor {
    entity: String,
    uri: String,
    database: String,
    collection: String,
}

impl MongoExtractor {
    pub fn new(
        entity: impl Into<String>,
        uri: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            uri: uri.into(),
            database: database.into(),
            collection: collection.into(),
        }
    }

    async fn open_cursor(&self) -> Result<Cursor<Document>> {
        info!(
            entity = %self.entity,
            database = %self.database,
            collection = %self.collection,
            "Reading collection"
        );

        let client = Client::with_uri_str(&self.uri)
            .await
            .map_err(|e| self.error(e))?;

        client
            .database(&self.database)
            .collection::<Document>(&self.collection)
            .find(doc! {})
            .await
            .map_err(|e| self.error(e))
    }

    fn error(&self, err: mongodb::error::Error) -> EtlError {
        let kind = match *err.kind {
            ErrorKind::Authentication { .. } => ExtractKind::Authentication,
            ErrorKind::Command(_) | ErrorKind::BsonDeserialization(_) => ExtractKind::Source,
            _ => ExtractKind::Network,
        };
        EtlError::extract(&self.entity, kind, err)
    }
}

impl Extractor for MongoExtractor {
    fn entity(&self) -> &str {
        &self.entity
    }

    fn extract(&self) -> RecordStream<'_> {
        stream::once(self.open_cursor())
            .map_ok(move |cursor| {
                cursor
                    .map_ok(document_to_record)
                    .map_err(move |e| self.error(e))
            })
            .try_flatten()
            .boxed()
    }
}

pub fn document_to_record(document: Document) -> Record {
    document
        .into_iter()
        .map(|(field, value)| (field, bson_to_value(value)))
        .collect()
}

fn bson_to_value(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i64::from(i)),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::Decimal128(d) => Value::Decimal(d.to_string()),
        Bson::String(s) | Bson::Symbol(s) => Value::Text(s),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis())
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Bson::Array(items) => Value::List(items.into_iter().map(bson_to_value).collect()),
        Bson::Document(doc) => Value::Map(document_to_record(doc)),
        other => Value::from_json(other.into_relaxed_extjson()),
    }
}
