//! Fixtures shared by the scheduler unit tests.

use std::collections::BTreeSet;

use dronegrid_state::{
    AtomicGroup, AtomicGroupId, Host, HostId, HostStatus, Job, JobId, Label, LabelId, Protection,
};

use crate::host_pool::HostPool;

pub const LABEL_X: LabelId = 1;
pub const LABEL_Y: LabelId = 2;
pub const LABEL_G: LabelId = 10;
pub const LABEL_G2: LabelId = 11;
pub const GROUP_G: AtomicGroupId = 100;
pub const GROUP_G2: AtomicGroupId = 200;

/// Every fixture host and job shares this ACL group.
pub const EVERYONE: u64 = 1;

pub fn host(id: HostId, labels: &[LabelId]) -> Host {
    Host {
        id,
        hostname: format!("host{id}"),
        labels: labels.iter().copied().collect(),
        acl_groups: BTreeSet::from([EVERYONE]),
        locked: false,
        protection: Protection::NoProtection,
        status: HostStatus::Ready,
    }
}

pub fn job(id: JobId) -> Job {
    Job {
        id,
        name: format!("job{id}"),
        owner: "debug_user".to_string(),
        priority: 0,
        synch_count: 1,
        dependency_labels: BTreeSet::new(),
        acl_groups: BTreeSet::from([EVERYONE]),
        ineligible_hosts: BTreeSet::new(),
        control_file: "control".to_string(),
        created_at: 0,
        timeout_hours: None,
        max_runtime_hours: None,
    }
}

pub fn plain_label(id: LabelId) -> Label {
    Label {
        id,
        name: format!("label{id}"),
        is_platform: false,
        atomic_group_id: None,
        only_if_needed: false,
        invalid: false,
    }
}

pub fn atomic_label(id: LabelId, group: AtomicGroupId) -> Label {
    Label {
        atomic_group_id: Some(group),
        ..plain_label(id)
    }
}

pub fn group(id: AtomicGroupId, max: u32) -> AtomicGroup {
    AtomicGroup {
        id,
        name: format!("group{id}"),
        max_number_of_machines: max,
    }
}

#[derive(Default)]
pub struct PoolBuilder {
    hosts: Vec<Host>,
    labels: Vec<Label>,
    groups: Vec<AtomicGroup>,
    jobs: Vec<Job>,
    busy: BTreeSet<HostId>,
}

impl PoolBuilder {
    /// Starts with plain labels `LABEL_X` and `LABEL_Y`.
    pub fn new() -> Self {
        Self {
            labels: vec![plain_label(LABEL_X), plain_label(LABEL_Y)],
            ..Self::default()
        }
    }

    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Adds or replaces a label by id.
    pub fn label(mut self, label: Label) -> Self {
        self.labels.retain(|l| l.id != label.id);
        self.labels.push(label);
        self
    }

    pub fn atomic_group(mut self, group: AtomicGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn busy(mut self, host_id: HostId) -> Self {
        self.busy.insert(host_id);
        self
    }

    pub fn build(self) -> HostPool {
        HostPool::new(self.hosts, self.labels, self.groups, self.jobs, self.busy)
    }
}
