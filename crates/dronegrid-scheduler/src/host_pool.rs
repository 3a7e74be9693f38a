//! Per-tick host pool snapshot.
//!
//! A [`HostPool`] is built from the state store at the start of each
//! scheduling pass, owned by that pass, and dropped when it ends. Nothing in
//! it outlives a tick, so the label cache pruning done while matching never
//! leaks into the next pass.

use std::collections::{BTreeMap, BTreeSet};

use dronegrid_state::{
    AtomicGroup, AtomicGroupId, Host, HostId, HostQueueEntry, Job, JobId, Label,
    LabelId, StateStore,
};
use tracing::debug;

use crate::atomic_group::AtomicGroupResolver;
use crate::error::{SchedulerError, SchedulerResult};

/// Queries and mutations metahost schedulers perform against the pool.
pub trait HostSchedulingUtility {
    /// Hosts currently cached under `label_id`, ascending.
    fn hosts_in_label(&self, label_id: LabelId) -> BTreeSet<HostId>;

    /// Drop `host_id` from the cached membership of `label_id`.
    fn remove_host_from_label(&mut self, host_id: HostId, label_id: LabelId);

    /// Take a host out of the pool. Fails if it was already taken.
    fn pop_host(&mut self, host_id: HostId) -> SchedulerResult<Host>;

    /// Hosts the entry's job is blocked from.
    fn ineligible_hosts_for_entry(&self, entry: &HostQueueEntry) -> BTreeSet<HostId>;

    /// Unlocked, idle, in a schedulable status and not yet popped.
    fn is_host_usable(&self, host_id: HostId) -> bool;

    /// ACL, dependency, only-if-needed and atomic group checks.
    fn is_host_eligible_for_job(&self, host_id: HostId, entry: &HostQueueEntry) -> bool;

    fn atomic_group(&self, group_id: AtomicGroupId) -> Option<AtomicGroup>;

    fn job(&self, job_id: JobId) -> Option<&Job>;

    /// Valid labels tied to an atomic group, ascending.
    fn atomic_group_labels(&self, group_id: AtomicGroupId) -> Vec<LabelId>;
}

/// Snapshot of hosts, labels and job constraints for one scheduling pass.
#[derive(Debug, Default)]
pub struct HostPool {
    hosts: BTreeMap<HostId, Host>,
    /// Hosts held by a Scheduled or Running entry.
    busy: BTreeSet<HostId>,
    popped: BTreeSet<HostId>,
    label_hosts: BTreeMap<LabelId, BTreeSet<HostId>>,
    labels: BTreeMap<LabelId, Label>,
    atomic_groups: BTreeMap<AtomicGroupId, AtomicGroup>,
    jobs: BTreeMap<JobId, Job>,
}

impl HostPool {
    pub fn new(
        hosts: Vec<Host>,
        labels: Vec<Label>,
        atomic_groups: Vec<AtomicGroup>,
        jobs: Vec<Job>,
        busy: BTreeSet<HostId>,
    ) -> Self {
        let mut label_hosts: BTreeMap<LabelId, BTreeSet<HostId>> = BTreeMap::new();
        for host in &hosts {
            for &label_id in &host.labels {
                label_hosts.entry(label_id).or_default().insert(host.id);
            }
        }

        Self {
            hosts: hosts.into_iter().map(|h| (h.id, h)).collect(),
            busy,
            popped: BTreeSet::new(),
            label_hosts,
            labels: labels.into_iter().map(|l| (l.id, l)).collect(),
            atomic_groups: atomic_groups.into_iter().map(|g| (g.id, g)).collect(),
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
        }
    }

    /// Load a fresh snapshot for scheduling `pending`.
    pub fn build(store: &StateStore, pending: &[HostQueueEntry]) -> SchedulerResult<Self> {
        let job_ids: BTreeSet<JobId> = pending.iter().map(|e| e.job_id).collect();
        let busy: BTreeSet<HostId> = store
            .fetch_queue_entries(|e| e.status.holds_host())?
            .into_iter()
            .filter_map(|e| e.host_id)
            .collect();

        let pool = Self::new(
            store.list_hosts()?,
            store.list_labels()?,
            store.list_atomic_groups()?,
            store.fetch_jobs(|j| job_ids.contains(&j.id))?,
            busy,
        );
        debug!(
            hosts = pool.hosts.len(),
            usable = pool.usable_host_count(),
            jobs = pool.jobs.len(),
            "host pool refreshed"
        );
        Ok(pool)
    }

    pub fn host(&self, host_id: HostId) -> Option<&Host> {
        self.hosts.get(&host_id)
    }

    pub fn usable_host_count(&self) -> usize {
        self.hosts
            .keys()
            .filter(|&&id| self.is_host_usable(id))
            .count()
    }

    pub fn resolver(&self) -> AtomicGroupResolver<'_> {
        AtomicGroupResolver::new(&self.labels)
    }

    fn is_acl_accessible(&self, host: &Host, job: &Job) -> bool {
        !host.acl_groups.is_disjoint(&job.acl_groups)
    }

    /// A host carrying an only-if-needed label may only serve a metahost
    /// entry that requested that label or depends on it. Entries naming a
    /// concrete host bypass the check.
    fn check_only_if_needed_labels(&self, host: &Host, job: &Job, entry: &HostQueueEntry) -> bool {
        let Some(meta_host) = entry.meta_host else {
            return true;
        };
        host.labels.iter().all(|label_id| {
            let only_if_needed = self
                .labels
                .get(label_id)
                .is_some_and(|label| label.only_if_needed);
            !only_if_needed || *label_id == meta_host || job.dependency_labels.contains(label_id)
        })
    }
}

impl HostSchedulingUtility for HostPool {
    fn hosts_in_label(&self, label_id: LabelId) -> BTreeSet<HostId> {
        self.label_hosts.get(&label_id).cloned().unwrap_or_default()
    }

    fn remove_host_from_label(&mut self, host_id: HostId, label_id: LabelId) {
        if let Some(hosts) = self.label_hosts.get_mut(&label_id) {
            hosts.remove(&host_id);
        }
    }

    fn pop_host(&mut self, host_id: HostId) -> SchedulerResult<Host> {
        if self.popped.contains(&host_id) {
            return Err(SchedulerError::HostAlreadyPopped(host_id));
        }
        let host = self
            .hosts
            .get(&host_id)
            .cloned()
            .ok_or(SchedulerError::HostNotInPool(host_id))?;
        self.popped.insert(host_id);
        Ok(host)
    }

    fn ineligible_hosts_for_entry(&self, entry: &HostQueueEntry) -> BTreeSet<HostId> {
        self.jobs
            .get(&entry.job_id)
            .map(|job| job.ineligible_hosts.clone())
            .unwrap_or_default()
    }

    fn is_host_usable(&self, host_id: HostId) -> bool {
        let Some(host) = self.hosts.get(&host_id) else {
            return false;
        };
        !self.popped.contains(&host_id)
            && !self.busy.contains(&host_id)
            && !host.locked
            && host.status.is_schedulable()
            && host.protection.permits_scheduling()
    }

    fn is_host_eligible_for_job(&self, host_id: HostId, entry: &HostQueueEntry) -> bool {
        let (Some(host), Some(job)) = (self.hosts.get(&host_id), self.jobs.get(&entry.job_id))
        else {
            return false;
        };
        self.is_acl_accessible(host, job)
            && job.dependency_labels.is_subset(&host.labels)
            && self.check_only_if_needed_labels(host, job, entry)
            && self.resolver().get_host_atomic_group_id(&host.labels, entry)
                == entry.atomic_group_id
    }

    fn atomic_group(&self, group_id: AtomicGroupId) -> Option<AtomicGroup> {
        self.atomic_groups.get(&group_id).cloned()
    }

    fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    fn atomic_group_labels(&self, group_id: AtomicGroupId) -> Vec<LabelId> {
        self.resolver().labels_for_group(group_id)
    }
}
