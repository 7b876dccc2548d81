//! Error Taxonomy
//!
//! This module defines the error categories surfaced to callers of the core.
//!
//! ## Error Categories
//!
//! ### InvalidArgument
//! Malformed user input: a document without `xt/id`, an invalid temporal
//! literal, `valid_from >= valid_to`. Raised synchronously, before any state
//! changes.
//!
//! ### Runtime
//! Evaluation failures inside an otherwise well-formed operation: temporal
//! coercion overflow, a type conflict discovered during a merge.
//!
//! ### Conflict
//! A transaction's system time would go backwards relative to a previously
//! committed transaction. Fails the submit; nothing is applied.
//!
//! ### Timeout
//! An `await_tx` wait exceeded its deadline. The query fails with no partial
//! results; the caller may retry with a later deadline.
//!
//! ### Storage
//! A buffer-pool or object-store read failed after retries.
//!
//! ## Usage
//!
//! All core operations return `Result<T>`, aliased to `Result<T, Error>`, so
//! errors propagate with `?`. The storage and index crates define their own
//! error enums and fold into this taxonomy at the node surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Storage(_))
    }
}
