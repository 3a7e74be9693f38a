//! Scheduler error types.

use dronegrid_state::{AtomicGroupId, HostId, JobId};
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("host {0} was already popped from the pool this tick")]
    HostAlreadyPopped(HostId),

    #[error("host {0} is not in the host pool")]
    HostNotInPool(HostId),

    #[error("no metahost scheduler to handle {0}")]
    NoMetahostScheduler(String),

    #[error("atomic group not found: {0}")]
    AtomicGroupNotFound(AtomicGroupId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("state store error: {0}")]
    State(#[from] dronegrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
