//! Pipeline error taxonomy
//!
//! Extract, transform and write failures travel unchanged from the entity that raised
//! them up to the orchestrator, which retries the layer and, once attempts run out,
//! wraps the last cause in [`EtlError::Orchestration`].

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Why an extractor could not produce records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    /// Source unreachable or connection dropped
    Network,
    /// Credentials rejected
    Authentication,
    /// Payload was not a list of objects (or a single object)
    MalformedPayload,
    /// Source answered with an error of its own
    Source,
}

impl std::fmt::Display for ExtractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractKind::Network => write!(f, "network"),
            ExtractKind::Authentication => write!(f, "authentication"),
            ExtractKind::MalformedPayload => write!(f, "malformed payload"),
            ExtractKind::Source => write!(f, "source"),
        }
    }
}

/// Why a sink write was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Key or constraint violation
    Constraint,
    /// Connection lost or pool exhausted
    Connectivity,
    /// Column type or DDL conflict
    SchemaConflict,
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteKind::Constraint => write!(f, "constraint violation"),
            WriteKind::Connectivity => write!(f, "connectivity"),
            WriteKind::SchemaConflict => write!(f, "schema conflict"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Extract failed for {entity} ({kind}): {message}")]
    Extract {
        entity: String,
        kind: ExtractKind,
        message: String,
    },

    #[error("Transform failed for {entity}: {message}")]
    Transform { entity: String, message: String },

    #[error("Write failed for {target} ({kind}): {message}")]
    Write {
        target: String,
        kind: WriteKind,
        message: String,
    },

    #[error("{step} failed after {attempts} attempt(s): {source}")]
    Orchestration {
        step: String,
        attempts: u32,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] medallion_common::MedallionError),
}

impl EtlError {
    pub fn extract(entity: impl Into<String>, kind: ExtractKind, message: impl ToString) -> Self {
        EtlError::Extract {
            entity: entity.into(),
            kind,
            message: message.to_string(),
        }
    }

    pub fn transform(entity: impl Into<String>, message: impl ToString) -> Self {
        EtlError::Transform {
            entity: entity.into(),
            message: message.to_string(),
        }
    }

    pub fn write(target: impl Into<String>, kind: WriteKind, message: impl ToString) -> Self {
        EtlError::Write {
            target: target.into(),
            kind,
            message: message.to_string(),
        }
    }

    /// Classify a database error raised while writing `target`
    pub fn from_write(target: impl Into<String>, err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // Class 23: integrity constraint violation
                Some(code) if code.starts_with("23") => WriteKind::Constraint,
                // Class 08: connection exception
                Some(code) if code.starts_with("08") => WriteKind::Connectivity,
                _ => WriteKind::SchemaConflict,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => WriteKind::Connectivity,
            _ => WriteKind::SchemaConflict,
        };
        EtlError::write(target, kind, err)
    }

    /// Classify a database error raised while reading from `entity`
    pub fn from_read(entity: impl Into<String>, err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("28P01") => {
                ExtractKind::Authentication
            },
            sqlx::Error::Database(db) if db.code().as_deref() == Some("28000") => {
                ExtractKind::Authentication
            },
            sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } => ExtractKind::Source,
            _ => ExtractKind::Network,
        };
        EtlError::extract(entity, kind, err)
    }
}
