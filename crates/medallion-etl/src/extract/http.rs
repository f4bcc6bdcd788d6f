//! JSON-over-HTTP extractor
//!
//! Accepts either a JSON array of objects or a single object, which is treated as a
//! one-record list.

use futures::{stream, StreamExt, TryStreamExt};
use medallion_common::Record;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use super::{Extractor, RecordStream};
use crate::error::{EtlError, ExtractKind, Result};

const USER_AGENT: &str = "medallion-etl/0.1";

pub struct HttpJsonExtractor {
    entity: String,
    url: String,
    client: Client,
}

impl HttpJsonExtractor {
    pub fn new(entity: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EtlError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(entity, url, client))
    }

    pub fn with_client(entity: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            entity: entity.into(),
            url: url.into(),
            client,
        }
    }

    async fn fetch(&self) -> Result<Vec<Record>> {
        info!(entity = %self.entity, url = %self.url, "Fetching records");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.error(ExtractKind::Network, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.error(ExtractKind::Authentication, format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(self.error(ExtractKind::Source, format!("HTTP error: {}", status)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.error(ExtractKind::MalformedPayload, e))?;

        let records = self.parse_payload(body)?;
        debug!(entity = %self.entity, count = records.len(), "Parsed payload");
        Ok(records)
    }

    fn parse_payload(&self, body: serde_json::Value) -> Result<Vec<Record>> {
        match body {
            serde_json::Value::Object(map) => Ok(vec![Record::from_json_object(map)]),
            serde_json::Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    Record::try_from_json(item).map_err(|e| {
                        self.error(ExtractKind::MalformedPayload, format!("item {}: {}", i, e))
                    })
                })
                .collect(),
            other => Err(self.error(
                ExtractKind::MalformedPayload,
                format!("expected a JSON array or object, got {}", other),
            )),
        }
    }

    fn error(&self, kind: ExtractKind, message: impl ToString) -> EtlError {
        EtlError::extract(&self.entity, kind, message)
    }
}

impl Extractor for HttpJsonExtractor {
    fn entity(&self) -> &str {
        &self.entity
    }

    fn extract(&self) -> RecordStream<'_> {
        stream::once(self.fetch())
            .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}
