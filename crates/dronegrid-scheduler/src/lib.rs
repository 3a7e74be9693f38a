//! dronegrid-scheduler — matches queued host queue entries to lab hosts.
//!
//! Each scheduling pass builds a [`HostPool`] snapshot from the state store,
//! walks the pending entries in priority order and hands each one to the
//! [`HostScheduler`]. Entries naming a concrete host are checked and popped
//! directly; label and atomic group entries go to the registered
//! [`MetahostScheduler`] variant that claims them.
//!
//! Scheduling only mutates the in-memory entries and the pool. The caller
//! persists assignments.

pub mod atomic_group;
pub mod error;
pub mod host_pool;
pub mod host_scheduler;
pub mod metahost;

#[cfg(test)]
mod testing;

pub use atomic_group::AtomicGroupResolver;
pub use error::{SchedulerError, SchedulerResult};
pub use host_pool::{HostPool, HostSchedulingUtility};
pub use host_scheduler::HostScheduler;
pub use metahost::{MetahostScheduler, ScheduleOutcome};
