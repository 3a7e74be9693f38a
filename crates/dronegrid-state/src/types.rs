//! Domain types for the DroneGrid state store.
//!
//! These types represent the persisted state of the lab: hosts and their
//! labels, atomic groups, jobs, the host queue entries linking jobs to
//! hosts, and out-of-band special tasks. All types are serializable to/from
//! JSON for storage in redb tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Unique identifier for a host.
pub type HostId = u64;

/// Unique identifier for a label.
pub type LabelId = u64;

/// Unique identifier for an atomic group.
pub type AtomicGroupId = u64;

/// Unique identifier for an ACL group.
pub type AclGroupId = u64;

/// Unique identifier for a job.
pub type JobId = u64;

/// Unique identifier for a host queue entry.
pub type EntryId = u64;

/// Unique identifier for a special task.
pub type TaskId = u64;

// ── Host ──────────────────────────────────────────────────────────

/// A lab machine that test jobs run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    /// Labels attached to this host.
    pub labels: BTreeSet<LabelId>,
    /// ACL groups this host belongs to.
    #[serde(default)]
    pub acl_groups: BTreeSet<AclGroupId>,
    /// Locked hosts are never scheduled or reverified.
    pub locked: bool,
    pub protection: Protection,
    pub status: HostStatus,
}

/// Lifecycle status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ready,
    Running,
    Verifying,
    Repairing,
    RepairFailed,
    Dead,
}

impl HostStatus {
    /// Whether a host in this status may be handed a new job.
    pub fn is_schedulable(self) -> bool {
        matches!(self, HostStatus::Ready)
    }
}

/// Which maintenance operations the scheduler may run against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    #[default]
    NoProtection,
    RepairSoftwareOnly,
    RepairFilesystemOnly,
    DoNotRepair,
    DoNotVerify,
}

impl Protection {
    /// Whether the scheduler may create Verify tasks for this host.
    pub fn permits_verify(self) -> bool {
        self != Protection::DoNotVerify
    }

    /// Whether the scheduler may create Repair tasks for this host.
    pub fn permits_repair(self) -> bool {
        !matches!(self, Protection::DoNotRepair | Protection::DoNotVerify)
    }

    /// Protection levels only restrict maintenance, never job execution.
    pub fn permits_scheduling(self) -> bool {
        true
    }
}

// ── Label / AtomicGroup ───────────────────────────────────────────

/// A host label, optionally tying its hosts to an atomic group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    pub is_platform: bool,
    pub atomic_group_id: Option<AtomicGroupId>,
    /// Hosts with this label only run jobs that explicitly ask for it.
    #[serde(default)]
    pub only_if_needed: bool,
    /// Invalid (deleted) labels are ignored for atomic group lookups.
    #[serde(default)]
    pub invalid: bool,
}

/// A named pool of hosts a job acquires a subset of simultaneously.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtomicGroup {
    pub id: AtomicGroupId,
    pub name: String,
    /// Upper bound on hosts acquired for one job.
    pub max_number_of_machines: u32,
}

// ── Job ───────────────────────────────────────────────────────────

/// A queued test job. Created externally; read-only to the scheduler
/// apart from ineligible-host bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    /// Higher runs first.
    pub priority: i32,
    /// Minimum number of hosts that must run this job together.
    pub synch_count: u32,
    /// Labels every assigned host must carry.
    #[serde(default)]
    pub dependency_labels: BTreeSet<LabelId>,
    /// ACL groups of the job owner.
    #[serde(default)]
    pub acl_groups: BTreeSet<AclGroupId>,
    /// Hosts this job has already been blocked from.
    #[serde(default)]
    pub ineligible_hosts: BTreeSet<HostId>,
    /// Path of the control file handed to the test harness.
    pub control_file: String,
    pub created_at: u64,
    /// Hours after `created_at` at which unfinished entries are aborted.
    #[serde(default)]
    pub timeout_hours: Option<u64>,
    /// Hours an entry may run once started.
    #[serde(default)]
    pub max_runtime_hours: Option<u64>,
}

// ── HostQueueEntry ────────────────────────────────────────────────

/// Status of a host queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Scheduled,
    Running,
    Completed,
    Aborted,
}

impl EntryStatus {
    /// Completed and Aborted entries never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Aborted)
    }

    /// Scheduled and Running entries hold their host.
    pub fn holds_host(self) -> bool {
        matches!(self, EntryStatus::Scheduled | EntryStatus::Running)
    }
}

/// Where a running entry's process lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRef {
    /// Unique execution tag (also the results subdirectory).
    pub tag: String,
    /// Hostname of the drone running the process.
    pub drone: String,
    /// Root process id, once the drone has reported it.
    pub pid: Option<u32>,
}

/// The unit of work linking a job to a (possibly unresolved) host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostQueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    pub host_id: Option<HostId>,
    /// Label to pick a host from when `host_id` is unset.
    pub meta_host: Option<LabelId>,
    pub atomic_group_id: Option<AtomicGroupId>,
    pub status: EntryStatus,
    #[serde(default)]
    pub execution: Option<ExecutionRef>,
    /// Unix timestamp (seconds) when the entry was dispatched.
    #[serde(default)]
    pub started_at: Option<u64>,
}

impl HostQueueEntry {
    /// A new queued entry against a concrete host.
    pub fn for_host(job_id: JobId, host_id: HostId) -> Self {
        Self {
            id: 0,
            job_id,
            host_id: Some(host_id),
            meta_host: None,
            atomic_group_id: None,
            status: EntryStatus::Queued,
            execution: None,
            started_at: None,
        }
    }

    /// A new queued entry against a label.
    pub fn for_label(job_id: JobId, label_id: LabelId) -> Self {
        Self {
            id: 0,
            job_id,
            host_id: None,
            meta_host: Some(label_id),
            atomic_group_id: None,
            status: EntryStatus::Queued,
            execution: None,
            started_at: None,
        }
    }

    /// A new queued entry against an atomic group.
    pub fn for_atomic_group(job_id: JobId, atomic_group_id: AtomicGroupId) -> Self {
        Self {
            id: 0,
            job_id,
            host_id: None,
            meta_host: None,
            atomic_group_id: Some(atomic_group_id),
            status: EntryStatus::Queued,
            execution: None,
            started_at: None,
        }
    }

    /// A new queued entry that runs without any host.
    pub fn hostless(job_id: JobId) -> Self {
        Self {
            id: 0,
            job_id,
            host_id: None,
            meta_host: None,
            atomic_group_id: None,
            status: EntryStatus::Queued,
            execution: None,
            started_at: None,
        }
    }

    /// Whether the entry still needs a host picked for it.
    pub fn is_metahost(&self) -> bool {
        self.host_id.is_none() && (self.meta_host.is_some() || self.atomic_group_id.is_some())
    }

    /// No host, label or atomic group: the job runs on a drone alone.
    pub fn is_hostless(&self) -> bool {
        self.host_id.is_none() && self.meta_host.is_none() && self.atomic_group_id.is_none()
    }

    /// Copy of this entry for an additional atomic group host.
    pub fn clone_for_host(&self, host_id: HostId) -> Self {
        Self {
            id: 0,
            host_id: Some(host_id),
            execution: None,
            started_at: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for HostQueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hqe {} (job {}", self.id, self.job_id)?;
        if let Some(host) = self.host_id {
            write!(f, ", host {host}")?;
        }
        if let Some(label) = self.meta_host {
            write!(f, ", meta_host {label}")?;
        }
        if let Some(group) = self.atomic_group_id {
            write!(f, ", atomic_group {group}")?;
        }
        if self.is_hostless() {
            write!(f, ", hostless")?;
        }
        write!(f, ")")
    }
}

// ── SpecialTask ───────────────────────────────────────────────────

/// Kind of out-of-band maintenance run against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialTaskKind {
    Verify,
    Repair,
    Cleanup,
}

/// A maintenance job against one host, completed by an external executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialTask {
    pub id: TaskId,
    pub host_id: HostId,
    pub task: SpecialTaskKind,
    /// Unix timestamp (seconds) when the task was requested.
    pub time_requested: u64,
    pub is_complete: bool,
    /// Unix timestamp (seconds) when the executor finished the task.
    #[serde(default)]
    pub time_finished: Option<u64>,
}

impl SpecialTask {
    /// A freshly requested, incomplete task.
    pub fn new(host_id: HostId, task: SpecialTaskKind, time_requested: u64) -> Self {
        Self {
            id: 0,
            host_id,
            task,
            time_requested,
            is_complete: false,
            time_finished: None,
        }
    }
}
