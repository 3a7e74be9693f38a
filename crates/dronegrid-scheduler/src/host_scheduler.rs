//! HostScheduler — routes each pending entry to the right matching strategy.

use dronegrid_state::{HostId, HostQueueEntry, StateStore};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::host_pool::{HostPool, HostSchedulingUtility};
use crate::metahost::{MetahostScheduler, ScheduleOutcome};

#[derive(Debug, Clone)]
pub struct HostScheduler {
    schedulers: Vec<MetahostScheduler>,
}

impl Default for HostScheduler {
    fn default() -> Self {
        Self::with_schedulers(MetahostScheduler::registered())
    }
}

impl HostScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit registration order. Earlier entries win when more
    /// than one scheduler claims an entry.
    pub fn with_schedulers(schedulers: Vec<MetahostScheduler>) -> Self {
        let names: Vec<String> = schedulers.iter().map(|s| s.to_string()).collect();
        info!(schedulers = %names.join(", "), "metahost schedulers registered");
        Self { schedulers }
    }

    /// Snapshot the host pool for one pass over `pending`.
    pub fn refresh(
        &self,
        store: &StateStore,
        pending: &[HostQueueEntry],
    ) -> SchedulerResult<HostPool> {
        HostPool::build(store, pending)
    }

    /// Try to place one entry against the pool. Hostless entries need no
    /// host and are always assigned.
    pub fn schedule_entry(
        &self,
        entry: &mut HostQueueEntry,
        utility: &mut dyn HostSchedulingUtility,
    ) -> SchedulerResult<ScheduleOutcome> {
        if let Some(host_id) = entry.host_id {
            return schedule_non_metahost(host_id, entry, utility);
        }
        if entry.is_hostless() {
            debug!(%entry, "hostless entry needs no host");
            return Ok(ScheduleOutcome::Assigned {
                extra_hosts: Vec::new(),
            });
        }

        let mut claims = self
            .schedulers
            .iter()
            .filter(|s| s.can_schedule_metahost(entry));
        let Some(scheduler) = claims.next() else {
            return Err(SchedulerError::NoMetahostScheduler(entry.to_string()));
        };
        let others: Vec<String> = claims.map(|s| s.to_string()).collect();
        if !others.is_empty() {
            error!(
                %entry,
                chosen = %scheduler,
                also_claimed_by = %others.join(", "),
                "more than one metahost scheduler claims entry"
            );
        }
        scheduler.schedule_metahost(entry, utility)
    }
}

fn schedule_non_metahost(
    host_id: HostId,
    entry: &HostQueueEntry,
    utility: &mut dyn HostSchedulingUtility,
) -> SchedulerResult<ScheduleOutcome> {
    if !utility.is_host_usable(host_id) || !utility.is_host_eligible_for_job(host_id, entry) {
        return Ok(ScheduleOutcome::Deferred);
    }
    utility.pop_host(host_id)?;
    Ok(ScheduleOutcome::Assigned {
        extra_hosts: Vec::new(),
    })
}
