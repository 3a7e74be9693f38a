//! Startup recovery of hosts left in `RepairFailed` or stuck mid-task.

use std::collections::BTreeSet;

use dronegrid_notify::Notifier;
use dronegrid_state::{HostId, HostStatus, SpecialTask, SpecialTaskKind, StateStore};
use tracing::{info, warn};

use crate::error::CleanupResult;
use crate::unix_now;
use crate::user_cleanup::hosts_with_pending_tasks;

/// Schedule a Cleanup task for every unlocked `RepairFailed` host and
/// notify about each one. Hosts that already have a task waiting are
/// skipped.
pub fn recover_hosts(store: &StateStore, notifier: &dyn Notifier) -> CleanupResult<Vec<HostId>> {
    let busy = hosts_with_pending_tasks(store)?;
    let hosts = store.fetch_hosts(|host| {
        host.status == HostStatus::RepairFailed && !host.locked && !busy.contains(&host.id)
    })?;

    let requested = unix_now();
    for host in &hosts {
        info!(hostname = %host.hostname, host_id = host.id, "recovering dead host");
        notifier.enqueue_notify_email(
            &format!("Host {} is in Repair Failed state", host.hostname),
            &format!("Reverifying dead host {}", host.hostname),
        );
        store.create_special_task(SpecialTask::new(
            host.id,
            SpecialTaskKind::Cleanup,
            requested,
        ))?;
    }
    Ok(hosts.iter().map(|h| h.id).collect())
}

/// Schedule a Cleanup task for unlocked hosts left `Verifying`,
/// `Repairing` or `Running` with nothing working on them: no pending
/// special task and no live queue entry holding the host.
///
/// Run after running executions have been re-attached, so entries that
/// are still running keep their hosts.
pub fn reverify_remaining_hosts(store: &StateStore) -> CleanupResult<Vec<HostId>> {
    let busy = hosts_with_pending_tasks(store)?;
    let held: BTreeSet<HostId> = store
        .fetch_queue_entries(|e| e.status.holds_host())?
        .into_iter()
        .filter_map(|e| e.host_id)
        .collect();
    let hosts = store.fetch_hosts(|host| {
        matches!(
            host.status,
            HostStatus::Verifying | HostStatus::Repairing | HostStatus::Running
        ) && !host.locked
            && !busy.contains(&host.id)
            && !held.contains(&host.id)
    })?;

    let requested = unix_now();
    for host in &hosts {
        warn!(
            hostname = %host.hostname,
            status = ?host.status,
            "recovering active host with nothing running on it"
        );
        store.create_special_task(SpecialTask::new(
            host.id,
            SpecialTaskKind::Cleanup,
            requested,
        ))?;
    }
    Ok(hosts.iter().map(|h| h.id).collect())
}
