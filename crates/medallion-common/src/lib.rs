//! Medallion Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared record model, content hashing, error handling and logging for the medallion
//! workspace.
//!
//! - **Records**: [`Record`] / [`Value`], the unit every pipeline layer moves around
//! - **Hashing**: [`content_hash`], the order-independent fingerprint used as merge key
//! - **Errors**: [`MedallionError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```
//! use medallion_common::{content_hash, Record};
//!
//! let a = Record::new().with("sku", "B-100").with("qty", 3);
//! let b = Record::new().with("qty", 3).with("sku", "B-100");
//! assert_eq!(content_hash(&a), content_hash(&b));
//! ```

pub mod error;
pub mod hash;
pub mod logging;
pub mod record;

pub use error::{MedallionError, Result};
pub use hash::{canonical_value, content_hash, ContentHash, HASH_KEY_FIELD};
pub use record::{Record, Value};
