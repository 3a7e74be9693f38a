//! dronegrid-drones — the scheduler's view of its worker machines.
//!
//! The [`DroneManager`] tracks, per drone, the executions the scheduler
//! started there and enforces each drone's `max_processes`. Dispatch is a
//! two-phase affair: [`DroneManager::execute_command`] decides and reserves
//! capacity synchronously, and [`DroneManager::execute_actions`] later fans
//! the queued calls out to every drone concurrently, bounded by a deadline.
//!
//! Every spawned process carries the dark mark environment variable
//! ([`DARK_MARK_ENV`]) so process-table scans after a restart can tell
//! scheduler-owned processes from unrelated ones with the same name.

pub mod drone;
pub mod error;
pub mod local;
pub mod manager;
pub mod process;
pub mod ssh;
pub mod transport;

pub use drone::{Drone, DroneSummary};
pub use error::{DroneError, DroneResult};
pub use local::LocalDrone;
pub use manager::{
    CompletedExecution, DispatchRequest, DroneManager, ExecuteReport, Execution, ExecutionState,
    FailedCall, RefreshReport, StartedExecution,
};
pub use process::{DARK_MARK_ENV, ProcessInspector, ProcessRecord, ProcfsInspector};
pub use ssh::SshDrone;
pub use transport::{
    DroneTransport, ExecuteRequest, TransportFactory, TransportFuture, default_transport_factory,
};
