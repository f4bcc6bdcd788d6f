//! Layer, target and load-summary types

use medallion_common::HASH_KEY_FIELD;
use serde::{Deserialize, Serialize};

/// Pipeline layer, ordered by execution dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Bronze, Layer::Silver, Layer::Gold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Bronze => "bronze",
            Layer::Silver => "silver",
            Layer::Gold => "gold",
        }
    }

    /// Capitalized name used in log messages
    pub fn title(&self) -> &'static str {
        match self {
            Layer::Bronze => "Bronze",
            Layer::Silver => "Silver",
            Layer::Gold => "Gold",
        }
    }

    /// Step name recorded in the execution log
    pub fn step_name(&self) -> String {
        format!("pipeline_{}", self.as_str())
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bronze" => Ok(Layer::Bronze),
            "silver" => Ok(Layer::Silver),
            "gold" => Ok(Layer::Gold),
            other => Err(format!("unknown layer '{}', expected bronze, silver or gold", other)),
        }
    }
}

/// How a sink applies a batch to its target table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Upsert by merge key
    Merge,
    /// Truncate and reload in one transaction
    Replace,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Merge => "merge",
            WriteMode::Replace => "replace",
        }
    }
}

/// Column identifying "the same logical row" across loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeKey {
    /// Content hash stored in [`HASH_KEY_FIELD`]
    ContentHash,
    /// Business key column
    Natural(&'static str),
}

impl MergeKey {
    pub fn column(&self) -> &'static str {
        match self {
            MergeKey::ContentHash => HASH_KEY_FIELD,
            MergeKey::Natural(column) => column,
        }
    }
}

/// Destination of one entity within a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerTarget {
    pub layer: Layer,
    pub entity: &'static str,
    pub mode: WriteMode,
    pub key: MergeKey,
}

impl LayerTarget {
    pub const fn new(layer: Layer, entity: &'static str, mode: WriteMode, key: MergeKey) -> Self {
        Self {
            layer,
            entity,
            mode,
            key,
        }
    }

    /// `layer.entity`, used in logs and error messages
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.layer, self.entity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Loaded,
    /// Batch was empty; replace targets are still truncated
    Empty,
}

/// Outcome of writing one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub layer: Layer,
    pub entity: String,
    pub mode: WriteMode,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    /// Rows discarded by a replace
    pub rows_removed: usize,
    pub status: TargetStatus,
}

impl LoadSummary {
    pub fn new(target: &LayerTarget, rows_read: usize) -> Self {
        Self {
            layer: target.layer,
            entity: target.entity.to_string(),
            mode: target.mode,
            rows_read,
            rows_written: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_removed: 0,
            status: TargetStatus::Empty,
        }
    }
}

/// Totals over the summaries of one layer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTotals {
    pub targets: usize,
    pub rows_read: usize,
    pub rows_written: usize,
}

impl LoadTotals {
    pub fn of(summaries: &[LoadSummary]) -> Self {
        summaries.iter().fold(Self::default(), |acc, s| Self {
            targets: acc.targets + 1,
            rows_read: acc.rows_read + s.rows_read,
            rows_written: acc.rows_written + s.rows_written,
        })
    }
}

impl std::fmt::Display for LoadTotals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} target(s), {} row(s) read, {} row(s) written",
            self.targets, self.rows_read, self.rows_written
        )
    }
}
