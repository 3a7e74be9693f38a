//! dronegrid-cleanup — the scheduler's slow-cadence maintenance passes.
//!
//! Each pass implements [`Cleanup`] on top of a [`PeriodicCleanup`] timer
//! and is driven by the dispatcher with an explicit `now`:
//!
//! - [`UserCleanup`] runs every `clean_interval_minutes`. It aborts jobs
//!   past their timeouts, checks database consistency, clears stale
//!   ineligible-host blocks and throttles reverification of hosts stuck in
//!   `RepairFailed`.
//! - [`TwentyFourHourUpkeep`] runs at startup and once a day, purging old
//!   completed special tasks.
//!
//! [`recover_hosts`] is a one-shot startup pass requested from the CLI;
//! [`reverify_remaining_hosts`] runs at every startup.

pub mod error;
pub mod periodic;
pub mod recovery;
pub mod upkeep;
pub mod user_cleanup;

pub use error::{CleanupError, CleanupResult};
pub use periodic::{Cleanup, PeriodicCleanup};
pub use recovery::{recover_hosts, reverify_remaining_hosts};
pub use upkeep::TwentyFourHourUpkeep;
pub use user_cleanup::UserCleanup;

/// Seconds since the Unix epoch, for special task timestamps.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
