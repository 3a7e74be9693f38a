//! Interval timer shared by the cleanup passes.

use std::time::{Duration, Instant};

use crate::error::CleanupResult;

/// Tracks when a cleanup pass last ran.
#[derive(Debug, Clone)]
pub struct PeriodicCleanup {
    interval: Duration,
    run_at_initialize: bool,
    last_run: Instant,
}

impl PeriodicCleanup {
    /// The first interval starts at `now`.
    pub fn new(interval: Duration, run_at_initialize: bool, now: Instant) -> Self {
        Self {
            interval,
            run_at_initialize,
            last_run: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn run_at_initialize(&self) -> bool {
        self.run_at_initialize
    }

    /// Strictly more than one interval has passed since the last run.
    pub fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_run) > self.interval
    }

    pub fn mark_run(&mut self, now: Instant) {
        self.last_run = now;
    }
}

/// A maintenance pass run on a [`PeriodicCleanup`] schedule.
pub trait Cleanup {
    fn timer(&mut self) -> &mut PeriodicCleanup;

    /// The pass itself.
    fn cleanup(&mut self, now: Instant) -> CleanupResult<()>;

    /// Run once at scheduler startup if the pass asks for it.
    fn initialize(&mut self, now: Instant) -> CleanupResult<()> {
        if self.timer().run_at_initialize() {
            self.cleanup(now)?;
            self.timer().mark_run(now);
        }
        Ok(())
    }

    /// Run the pass if its interval has elapsed. Returns whether it ran.
    fn run_cleanup_maybe(&mut self, now: Instant) -> CleanupResult<bool> {
        if !self.timer().is_due(now) {
            return Ok(false);
        }
        self.cleanup(now)?;
        self.timer().mark_run(now);
        Ok(true)
    }
}
