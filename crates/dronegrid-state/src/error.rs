//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// A redb open, transaction, table or row operation failed.
    #[error("state store {op} failed: {message}")]
    Storage { op: &'static str, message: String },

    /// A record could not be turned into or read back from JSON.
    #[error("cannot {op} record: {message}")]
    Codec { op: &'static str, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
}
