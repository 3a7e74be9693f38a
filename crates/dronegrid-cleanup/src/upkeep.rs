//! Daily upkeep: purge old completed special tasks.

use std::time::{Duration, Instant};

use dronegrid_state::StateStore;
use tracing::info;

use crate::error::CleanupResult;
use crate::periodic::{Cleanup, PeriodicCleanup};
use crate::unix_now;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs at startup and then every twenty-four hours.
pub struct TwentyFourHourUpkeep {
    store: StateStore,
    timer: PeriodicCleanup,
    retention_days: u64,
}

impl TwentyFourHourUpkeep {
    pub fn new(store: StateStore, retention_days: u64, now: Instant) -> Self {
        Self {
            store,
            timer: PeriodicCleanup::new(DAY, true, now),
            retention_days,
        }
    }

    pub fn set_retention_days(&mut self, days: u64) {
        self.retention_days = days;
    }

    /// Delete completed tasks that finished more than the retention window
    /// before `unix_now`. Tasks without a finish time use their request
    /// time.
    pub fn purge_completed_tasks(&self, unix_now: u64) -> CleanupResult<u32> {
        let cutoff = unix_now.saturating_sub(self.retention_days * DAY.as_secs());
        let expired: Vec<_> = self
            .store
            .fetch_special_tasks(|t| {
                t.is_complete && t.time_finished.unwrap_or(t.time_requested) < cutoff
            })?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete_special_tasks(&expired)?;
        info!(removed, retention_days = self.retention_days, "purged old special tasks");
        Ok(removed)
    }
}

impl Cleanup for TwentyFourHourUpkeep {
    fn timer(&mut self) -> &mut PeriodicCleanup {
        &mut self.timer
    }

    fn cleanup(&mut self, _now: Instant) -> CleanupResult<()> {
        info!("running 24 hour upkeep");
        self.purge_completed_tasks(unix_now())?;
        Ok(())
    }
}
