//! Error types shared by the medallion crates

use thiserror::Error;

/// Result type alias for medallion operations
pub type Result<T> = std::result::Result<T, MedallionError>;

/// Errors raised by the shared record model and its helpers
#[derive(Error, Debug)]
pub enum MedallionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Cannot convert field {field} to {target}: {value}")]
    Conversion {
        field: String,
        target: &'static str,
        value: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}
