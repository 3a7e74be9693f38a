//! Cleanup error types.

use dronegrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type CleanupResult<T> = Result<T, CleanupError>;
