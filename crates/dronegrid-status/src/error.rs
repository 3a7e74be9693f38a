use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type StatusResult<T> = Result<T, StatusError>;
