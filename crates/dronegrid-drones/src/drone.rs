//! A single worker machine as the manager sees it.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::transport::{DroneTransport, ExecuteRequest};

/// A call waiting for the next `execute_actions` fan-out.
#[derive(Debug, Clone)]
pub(crate) enum DroneCall {
    Execute(ExecuteRequest),
    Kill(u32),
}

pub struct Drone {
    pub(crate) hostname: String,
    pub(crate) transport: Arc<dyn DroneTransport>,
    pub(crate) enabled: bool,
    pub(crate) max_processes: u32,
    pub(crate) allowed_users: Option<BTreeSet<String>>,
    /// False after a timed-out call; reset by the next refresh.
    pub(crate) reachable: bool,
    /// Owned processes seen by the last successful process-table read.
    pub(crate) reported_processes: usize,
    pub(crate) queue: Vec<DroneCall>,
}

impl Drone {
    pub(crate) fn new(hostname: impl Into<String>, transport: Arc<dyn DroneTransport>) -> Self {
        Self {
            hostname: hostname.into(),
            transport,
            enabled: true,
            max_processes: 0,
            allowed_users: None,
            reachable: true,
            reported_processes: 0,
            queue: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_processes(&self) -> u32 {
        self.max_processes
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    /// Drones without a user list accept everyone.
    pub fn usable_by(&self, username: &str) -> bool {
        self.allowed_users
            .as_ref()
            .is_none_or(|users| users.contains(username))
    }
}

impl std::fmt::Debug for Drone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drone")
            .field("hostname", &self.hostname)
            .field("enabled", &self.enabled)
            .field("max_processes", &self.max_processes)
            .field("reachable", &self.reachable)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Orders two drones by used capacity fraction, then larger capacity first.
///
/// `Less` means `a` is the better dispatch target.
pub(crate) fn compare_load(a_active: u32, a_max: u32, b_active: u32, b_max: u32) -> Ordering {
    let a_used = u64::from(a_active) * u64::from(b_max);
    let b_used = u64::from(b_active) * u64::from(a_max);
    a_used.cmp(&b_used).then_with(|| b_max.cmp(&a_max))
}

/// Per-drone load shown on the status page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroneSummary {
    pub hostname: String,
    pub active_processes: u32,
    pub max_processes: u32,
    pub enabled: bool,
    pub reachable: bool,
    pub reported_processes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emptier_drone_wins() {
        assert_eq!(compare_load(1, 10, 5, 10), Ordering::Less);
        assert_eq!(compare_load(5, 10, 1, 10), Ordering::Greater);
        // 2/10 is less loaded than 1/4
        assert_eq!(compare_load(2, 10, 1, 4), Ordering::Less);
    }

    #[test]
    fn equal_load_prefers_larger_drone() {
        assert_eq!(compare_load(0, 20, 0, 5), Ordering::Less);
        assert_eq!(compare_load(1, 5, 2, 10), Ordering::Greater);
        assert_eq!(compare_load(3, 6, 3, 6), Ordering::Equal);
    }
}
