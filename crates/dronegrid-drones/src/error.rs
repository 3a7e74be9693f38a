//! Drone manager error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroneError {
    #[error("no drones configured")]
    NoDrones,

    #[error("unknown drone: {0}")]
    UnknownDrone(String),

    #[error("execution {0} is already tracked")]
    DuplicateExecution(String),

    #[error("drone {drone}: {source}")]
    Transport {
        drone: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type DroneResult<T> = Result<T, DroneError>;
