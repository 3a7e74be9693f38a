//! What the dispatcher publishes for the status page.

use dronegrid_drones::DroneSummary;
use serde::Serialize;

/// Scheduler state as of the end of the last tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Ticks completed since startup.
    pub tick: u64,
    /// Unix time the snapshot was taken.
    pub updated_at: u64,
    /// Effective configuration, as `(name, value)` pairs.
    pub config: Vec<(String, String)>,
    pub drones: Vec<DroneSummary>,
    pub queued_entries: usize,
    pub active_entries: usize,
    pub total_running_processes: u32,
    /// Error of the last failed tick, cleared by the next good one.
    pub last_error: Option<String>,
}

/// Ask the dispatcher to reload its configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigureRequest;
