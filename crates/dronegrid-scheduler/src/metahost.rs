//! Metahost schedulers — resolve label and atomic group requests to hosts.
//!
//! The registered set is closed: every variant of [`MetahostScheduler`] is
//! listed here and partitions entries by which optional field is set.
//! Label entries have `meta_host` and no atomic group; atomic group entries
//! have `atomic_group_id` (and optionally a `meta_host` restricting which of
//! the group's hosts qualify).

use std::collections::BTreeSet;
use std::fmt;

use dronegrid_state::{EntryStatus, HostId, HostQueueEntry};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::host_pool::HostSchedulingUtility;

/// What a scheduling attempt did to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No suitable host this tick; the entry stays Queued.
    Deferred,
    /// `entry.host_id` was set. Each of `extra_hosts` needs its own clone
    /// of the entry.
    Assigned { extra_hosts: Vec<HostId> },
    /// The entry can never be satisfied and was marked Aborted.
    Aborted,
}

/// Closed set of metahost matching strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetahostScheduler {
    Label,
    AtomicGroup,
}

impl MetahostScheduler {
    /// The default registration order.
    pub fn registered() -> Vec<MetahostScheduler> {
        vec![MetahostScheduler::Label, MetahostScheduler::AtomicGroup]
    }

    pub fn can_schedule_metahost(&self, entry: &HostQueueEntry) -> bool {
        if entry.host_id.is_some() {
            return false;
        }
        match self {
            MetahostScheduler::Label => {
                entry.meta_host.is_some() && entry.atomic_group_id.is_none()
            }
            MetahostScheduler::AtomicGroup => entry.atomic_group_id.is_some(),
        }
    }

    /// Try to place `entry`, mutating its in-memory `host_id`/`status`.
    pub fn schedule_metahost(
        &self,
        entry: &mut HostQueueEntry,
        utility: &mut dyn HostSchedulingUtility,
    ) -> SchedulerResult<ScheduleOutcome> {
        match self {
            MetahostScheduler::Label => schedule_label(entry, utility),
            MetahostScheduler::AtomicGroup => schedule_atomic_group(entry, utility),
        }
    }
}

impl fmt::Display for MetahostScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetahostScheduler::Label => write!(f, "LabelMetahostScheduler"),
            MetahostScheduler::AtomicGroup => write!(f, "AtomicGroupMetahostScheduler"),
        }
    }
}

/// First fit over the label's hosts in ascending id order.
fn schedule_label(
    entry: &mut HostQueueEntry,
    utility: &mut dyn HostSchedulingUtility,
) -> SchedulerResult<ScheduleOutcome> {
    let Some(label_id) = entry.meta_host else {
        return Err(SchedulerError::NoMetahostScheduler(entry.to_string()));
    };
    let candidates = utility.hosts_in_label(label_id);
    let ineligible = utility.ineligible_hosts_for_entry(entry);

    for host_id in candidates {
        if !utility.is_host_usable(host_id) {
            // Unusable for every entry this tick.
            utility.remove_host_from_label(host_id, label_id);
            continue;
        }
        if ineligible.contains(&host_id) || !utility.is_host_eligible_for_job(host_id, entry) {
            continue;
        }
        let host = utility.pop_host(host_id)?;
        debug!(%entry, hostname = %host.hostname, "metahost entry assigned");
        entry.host_id = Some(host.id);
        return Ok(ScheduleOutcome::Assigned {
            extra_hosts: Vec::new(),
        });
    }
    Ok(ScheduleOutcome::Deferred)
}

/// Pick between `synch_count` and `max_number_of_machines` hosts from a
/// single label of the entry's atomic group.
fn schedule_atomic_group(
    entry: &mut HostQueueEntry,
    utility: &mut dyn HostSchedulingUtility,
) -> SchedulerResult<ScheduleOutcome> {
    let Some(group_id) = entry.atomic_group_id else {
        return Err(SchedulerError::NoMetahostScheduler(entry.to_string()));
    };
    let group = utility
        .atomic_group(group_id)
        .ok_or(SchedulerError::AtomicGroupNotFound(group_id))?;
    let job = utility
        .job(entry.job_id)
        .ok_or(SchedulerError::JobNotFound(entry.job_id))?;
    let min_hosts = job.synch_count.max(1) as usize;
    let max_hosts = group.max_number_of_machines as usize;

    if min_hosts > max_hosts {
        error!(
            job = entry.job_id,
            synch_count = min_hosts,
            atomic_group = group.id,
            max_number_of_machines = max_hosts,
            %entry,
            "job needs more hosts than its atomic group allows, aborting entry"
        );
        entry.status = EntryStatus::Aborted;
        return Ok(ScheduleOutcome::Aborted);
    }

    let restrict_to: Option<BTreeSet<HostId>> =
        entry.meta_host.map(|label_id| utility.hosts_in_label(label_id));
    let ineligible = utility.ineligible_hosts_for_entry(entry);

    for label_id in utility.atomic_group_labels(group_id) {
        let mut eligible = Vec::new();
        for host_id in utility.hosts_in_label(label_id) {
            if !utility.is_host_usable(host_id) {
                utility.remove_host_from_label(host_id, label_id);
                continue;
            }
            if restrict_to.as_ref().is_some_and(|r| !r.contains(&host_id)) {
                continue;
            }
            if ineligible.contains(&host_id) {
                continue;
            }
            if utility.is_host_eligible_for_job(host_id, entry) {
                eligible.push(host_id);
            }
        }

        if eligible.len() < min_hosts {
            continue;
        }
        eligible.truncate(max_hosts);

        let mut hostnames = Vec::with_capacity(eligible.len());
        for &host_id in &eligible {
            hostnames.push(utility.pop_host(host_id)?.hostname);
        }
        info!(%entry, hosts = ?hostnames, "expanding atomic group entry");

        entry.host_id = Some(eligible[0]);
        return Ok(ScheduleOutcome::Assigned {
            extra_hosts: eligible[1..].to_vec(),
        });
    }
    Ok(ScheduleOutcome::Deferred)
}
