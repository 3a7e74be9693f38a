//! Drone transport — how the scheduler reaches a worker machine.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use dronegrid_config::{DroneConfig, TransportKind};

use crate::local::LocalDrone;
use crate::process::{ProcessRecord, ProcfsInspector};
use crate::ssh::SshDrone;

/// Boxed future alias for transport calls.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A command the scheduler wants started on a drone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Execution tag; also names the working directory.
    pub tag: String,
    /// argv, program first.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// stdout and stderr are appended here.
    pub log_file: PathBuf,
    /// Value for the dark mark environment variable.
    pub dark_mark: String,
}

/// Start, enumerate and kill processes on one drone.
///
/// Implementations must stamp the dark mark onto every spawned process and
/// start it as the leader of a new process group.
pub trait DroneTransport: Send + Sync {
    /// The drone's full process table.
    fn process_table(&self) -> TransportFuture<'_, Vec<ProcessRecord>>;

    /// Start a process, returning its pid.
    fn execute(&self, request: ExecuteRequest) -> TransportFuture<'_, u32>;

    /// SIGCONT then SIGTERM.
    fn kill(&self, pid: u32) -> TransportFuture<'_, ()>;
}

/// Builds the transport for a configured drone.
pub type TransportFactory =
    Box<dyn Fn(&str, &DroneConfig) -> Arc<dyn DroneTransport> + Send + Sync>;

/// Local drones read `/proc`; ssh drones shell out to `ssh`.
pub fn default_transport_factory() -> TransportFactory {
    Box::new(|hostname: &str, config: &DroneConfig| -> Arc<dyn DroneTransport> {
        match config.transport {
            TransportKind::Local => Arc::new(LocalDrone::new(ProcfsInspector::default())),
            TransportKind::Ssh => Arc::new(SshDrone::new(hostname, config.ssh_user.clone())),
        }
    })
}
