//! Pipeline configuration
//!
//! Everything is read from the environment (optionally seeded from a `.env` file):
//! source endpoints, warehouse connections per layer, retry policy and schedule.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EtlError, Result};
use crate::models::Layer;

// ============================================================================
// Defaults
// ============================================================================

/// Default warehouse URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/medallion";

/// Default maximum connections per warehouse pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default pool acquire timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Schema holding the execution log table.
pub const DEFAULT_EXECUTION_LOG_SCHEMA: &str = "public";

pub const DEFAULT_MONGODB_DATABASE: &str = "stock_data";
pub const DEFAULT_MONGODB_COLLECTION: &str = "stock";
pub const DEFAULT_SALES_TABLE: &str = "sales";

/// Attempts per layer before the cycle halts.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Fixed delay between attempts, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 10;

/// Pause between scheduler cycles, in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 180;

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub warehouse: WarehouseConfig,
    pub sources: SourcesConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
}

/// Connection to the store of one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStoreConfig {
    pub url: String,
    pub schema: String,
}

/// Warehouse connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub bronze: LayerStoreConfig,
    pub silver: LayerStoreConfig,
    pub gold: LayerStoreConfig,
    pub execution_log: LayerStoreConfig,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Extraction sources of the bronze layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub products_url: String,
    pub customers_url: String,
    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub mongodb_collection: String,
    pub sales_database_url: String,
    pub sales_table: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl PipelineConfig {
    /// Load configuration from `.env` and the process environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = var("DATABASE_URL", DEFAULT_DATABASE_URL);
        let store = |layer: Layer| LayerStoreConfig {
            url: var(
                &format!("{}_DATABASE_URL", layer.as_str().to_uppercase()),
                &database_url,
            ),
            schema: var(&format!("{}_SCHEMA", layer.as_str().to_uppercase()), layer.as_str()),
        };

        Ok(Self {
            warehouse: WarehouseConfig {
                bronze: store(Layer::Bronze),
                silver: store(Layer::Silver),
                gold: store(Layer::Gold),
                execution_log: LayerStoreConfig {
                    url: var("EXECUTION_LOG_DATABASE_URL", &database_url),
                    schema: var("EXECUTION_LOG_SCHEMA", DEFAULT_EXECUTION_LOG_SCHEMA),
                },
                max_connections: parsed(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                connect_timeout_secs: parsed(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            sources: SourcesConfig {
                products_url: var("SOURCE_PRODUCTS_URL", ""),
                customers_url: var("SOURCE_CUSTOMERS_URL", ""),
                mongodb_uri: var("SOURCE_MONGODB_URI", ""),
                mongodb_database: var("SOURCE_MONGODB_DATABASE", DEFAULT_MONGODB_DATABASE),
                mongodb_collection: var("SOURCE_MONGODB_COLLECTION", DEFAULT_MONGODB_COLLECTION),
                sales_database_url: var("SOURCE_SALES_DATABASE_URL", ""),
                sales_table: var("SOURCE_SALES_TABLE", DEFAULT_SALES_TABLE),
            },
            retry: RetryConfig {
                attempts: parsed(&lookup, "PIPELINE_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?,
                delay_secs: parsed(&lookup, "PIPELINE_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY_SECS)?,
            },
            schedule: ScheduleConfig {
                interval_secs: parsed(&lookup, "PIPELINE_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            },
        })
    }

    /// Validate settings every command needs
    pub fn validate(&self) -> Result<()> {
        for (name, store) in [
            ("bronze", &self.warehouse.bronze),
            ("silver", &self.warehouse.silver),
            ("gold", &self.warehouse.gold),
            ("execution log", &self.warehouse.execution_log),
        ] {
            if store.url.is_empty() {
                return Err(EtlError::Config(format!("{} database URL cannot be empty", name)));
            }
            if !is_valid_identifier(&store.schema) {
                return Err(EtlError::Config(format!(
                    "{} schema '{}' must be a lowercase SQL identifier",
                    name, store.schema
                )));
            }
        }

        if self.warehouse.max_connections == 0 {
            return Err(EtlError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(EtlError::Config(
                "PIPELINE_RETRY_ATTEMPTS must be greater than 0".to_string(),
            ));
        }
        if self.schedule.interval_secs == 0 {
            return Err(EtlError::Config(
                "PIPELINE_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if !is_valid_identifier(&self.sources.sales_table) {
            return Err(EtlError::Config(format!(
                "SOURCE_SALES_TABLE '{}' must be a lowercase SQL identifier",
                self.sources.sales_table
            )));
        }

        Ok(())
    }

    /// Validate the source settings the bronze layer needs
    pub fn validate_sources(&self) -> Result<()> {
        let required = [
            ("SOURCE_PRODUCTS_URL", &self.sources.products_url),
            ("SOURCE_CUSTOMERS_URL", &self.sources.customers_url),
            ("SOURCE_MONGODB_URI", &self.sources.mongodb_uri),
            ("SOURCE_SALES_DATABASE_URL", &self.sources.sales_database_url),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(key, _)| *key)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EtlError::Config(format!("missing source settings: {}", missing.join(", "))))
        }
    }

    pub fn store(&self, layer: Layer) -> &LayerStoreConfig {
        match layer {
            Layer::Bronze => &self.warehouse.bronze,
            Layer::Silver => &self.warehouse.silver,
            Layer::Gold => &self.warehouse.gold,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl WarehouseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

/// Numeric variable parsed straight into the field type; out-of-range values are errors
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            EtlError::Config(format!(
                "{} must be a {} number, got '{}'",
                key,
                std::any::type_name::<T>(),
                raw
            ))
        }),
        None => Ok(default),
    }
}

/// Lowercase ASCII identifier usable unquoted in SQL
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}
