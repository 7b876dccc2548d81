//! Storage Error Types
//!
//! Everything that can go wrong between a segment's bytes and its decoded
//! form: object-store failures, Arrow IPC decode failures, meta-file
//! corruption. All storage operations return `Result<T>`, aliased to
//! `Result<T, Error>`, so errors propagate with `?`; the node surface folds
//! these into the core taxonomy as `Storage` errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("meta encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("document encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt segment meta: {0}")]
    CorruptMeta(String),

    #[error("invalid segment file name: {0}")]
    InvalidSegmentName(String),

    #[error("data page {0} out of range")]
    PageOutOfRange(u32),
}

impl From<Error> for timehouse_core::Error {
    fn from(e: Error) -> Self {
        timehouse_core::Error::Storage(e.to_string())
    }
}
