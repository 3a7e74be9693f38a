//! Dispatcher error types.

use dronegrid_cleanup::CleanupError;
use dronegrid_config::ConfigError;
use dronegrid_drones::DroneError;
use dronegrid_scheduler::SchedulerError;
use dronegrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("drone error: {0}")]
    Drone(#[from] DroneError),

    #[error("cleanup error: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scheduler is disabled by configuration")]
    SchedulerDisabled,
}

pub type DispatchResult<T> = Result<T, DispatchError>;
