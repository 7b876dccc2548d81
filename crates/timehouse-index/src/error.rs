//! Index Error Types
//!
//! The read/write path mostly fails in one of two ways: a core taxonomy error
//! (bad argument, conflict, timeout) or a storage failure underneath. Both
//! propagate with `?`; the node surface hands callers the core taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] timehouse_core::Error),

    #[error(transparent)]
    Storage(#[from] timehouse_storage::Error),
}

impl From<Error> for timehouse_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Core(inner) => inner,
            Error::Storage(inner) => inner.into(),
        }
    }
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::Core(timehouse_core::Error::InvalidArgument(msg.into()))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Core(timehouse_core::Error::Conflict(msg.into()))
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Core(timehouse_core::Error::Timeout(msg.into()))
    }
}
