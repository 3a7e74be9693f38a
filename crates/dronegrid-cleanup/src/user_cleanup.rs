//! UserCleanup — job timeouts, consistency checks, stale blocks and host
//! reverification.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dronegrid_config::SchedulerConfig;
use dronegrid_notify::Notifier;
use dronegrid_state::{
    EntryStatus, Host, HostId, HostQueueEntry, HostStatus, JobId, SpecialTask, SpecialTaskKind,
    StateStore,
};
use tracing::{debug, error, info, warn};

use crate::error::CleanupResult;
use crate::periodic::{Cleanup, PeriodicCleanup};
use crate::unix_now;

/// Inconsistent entries listed in one notification.
const MAX_LISTED_ENTRIES: usize = 50;

const SECS_PER_HOUR: u64 = 3600;

pub struct UserCleanup {
    store: StateStore,
    notifier: Arc<dyn Notifier>,
    timer: PeriodicCleanup,
    reverify_period: Option<Duration>,
    reverify_max_hosts_at_once: u32,
    synch_start_timeout: Option<Duration>,
    last_reverify: Option<Instant>,
    /// Last host handed a Verify task; the next pass starts after it.
    reverify_cursor: Option<HostId>,
}

impl UserCleanup {
    pub fn new(
        store: StateStore,
        notifier: Arc<dyn Notifier>,
        config: &SchedulerConfig,
        now: Instant,
    ) -> Self {
        Self {
            store,
            notifier,
            timer: PeriodicCleanup::new(config.clean_interval(), false, now),
            reverify_period: config.reverify_period(),
            reverify_max_hosts_at_once: config.scheduler.reverify_max_hosts_at_once,
            synch_start_timeout: config.synch_job_start_timeout(),
            last_reverify: None,
            reverify_cursor: None,
        }
    }

    /// Pick up reloaded interval and throttle settings.
    pub fn apply_config(&mut self, config: &SchedulerConfig) {
        self.timer.set_interval(config.clean_interval());
        self.reverify_period = config.reverify_period();
        self.reverify_max_hosts_at_once = config.scheduler.reverify_max_hosts_at_once;
        self.synch_start_timeout = config.synch_job_start_timeout();
    }

    /// Abort every unfinished entry of jobs older than their
    /// `timeout_hours`. `now` is Unix seconds.
    pub fn abort_timed_out_jobs(&self, now: u64) -> CleanupResult<Vec<JobId>> {
        info!("aborting jobs that have timed out and are not complete");
        let expired = self.store.fetch_jobs(|job| {
            job.timeout_hours
                .is_some_and(|hours| job.created_at.saturating_add(hours * SECS_PER_HOUR) < now)
        })?;
        let mut aborted = Vec::new();
        for job in expired {
            let entries = self
                .store
                .fetch_queue_entries(|e| e.job_id == job.id && !e.status.is_terminal())?;
            if entries.is_empty() {
                continue;
            }
            warn!(job_id = job.id, "aborting job due to job timeout");
            self.abort_entries(entries)?;
            aborted.push(job.id);
        }
        Ok(aborted)
    }

    /// Abort synchronous jobs that hold hosts but have not started within
    /// `synch_job_start_timeout_minutes` of creation. Entries already
    /// running are left alone.
    pub fn abort_jobs_past_synch_start_timeout(&self, now: u64) -> CleanupResult<Vec<JobId>> {
        let Some(timeout) = self.synch_start_timeout else {
            return Ok(Vec::new());
        };
        info!("aborting synchronous jobs that are past the start timeout");
        let cutoff = now.saturating_sub(timeout.as_secs());
        let waiting: BTreeSet<JobId> = self
            .store
            .fetch_queue_entries(|e| e.status == EntryStatus::Scheduled)?
            .into_iter()
            .map(|e| e.job_id)
            .collect();
        let stale = self.store.fetch_jobs(|job| {
            job.synch_count > 1 && job.created_at < cutoff && waiting.contains(&job.id)
        })?;
        let mut aborted = Vec::new();
        for job in stale {
            let entries = self.store.fetch_queue_entries(|e| {
                e.job_id == job.id && !e.status.is_terminal() && e.status != EntryStatus::Running
            })?;
            warn!(job_id = job.id, entries = entries.len(), "aborting job due to start timeout");
            self.abort_entries(entries)?;
            aborted.push(job.id);
        }
        Ok(aborted)
    }

    /// Abort running entries that started more than their job's
    /// `max_runtime_hours` ago.
    pub fn abort_jobs_past_max_runtime(&self, now: u64) -> CleanupResult<usize> {
        info!("aborting entries that have passed maximum runtime");
        let limits: BTreeMap<JobId, u64> = self
            .store
            .fetch_jobs(|job| job.max_runtime_hours.is_some())?
            .into_iter()
            .filter_map(|job| job.max_runtime_hours.map(|hours| (job.id, hours)))
            .collect();
        if limits.is_empty() {
            return Ok(0);
        }
        let overdue = self.store.fetch_queue_entries(|e| {
            e.status == EntryStatus::Running
                && e.started_at.zip(limits.get(&e.job_id)).is_some_and(|(started, hours)| {
                    started.saturating_add(hours * SECS_PER_HOUR) < now
                })
        })?;
        for entry in &overdue {
            warn!(%entry, "aborting entry due to max runtime");
        }
        let count = overdue.len();
        self.abort_entries(overdue)?;
        Ok(count)
    }

    /// Mark entries Aborted; the dispatcher kills their processes.
    fn abort_entries(&self, mut entries: Vec<HostQueueEntry>) -> CleanupResult<()> {
        for entry in &mut entries {
            entry.status = EntryStatus::Aborted;
        }
        self.store.save_queue_entries(&entries)?;
        Ok(())
    }

    /// Email about metahost entries that hold a host slot without a host.
    pub fn check_for_db_inconsistencies(&self) -> CleanupResult<usize> {
        info!("checking for db inconsistencies");
        let broken = self.store.fetch_queue_entries(|e| {
            e.status.holds_host() && e.host_id.is_none() && !e.is_hostless()
        })?;
        if broken.is_empty() {
            return Ok(0);
        }

        let subject = format!("{} queue entries found active without a host", broken.len());
        let mut message = broken
            .iter()
            .take(MAX_LISTED_ENTRIES)
            .map(|entry| format!("{entry} status={:?}", entry.status))
            .collect::<Vec<_>>()
            .join("\n");
        if broken.len() > MAX_LISTED_ENTRIES {
            message.push_str("\n(truncated)\n");
        }
        error!(count = broken.len(), "{subject}");
        self.notifier.enqueue_notify_email(&subject, &message);
        Ok(broken.len())
    }

    /// Drop per-job ineligible-host blocks once every entry of the job has
    /// finished.
    pub fn clear_inactive_blocks(&self) -> CleanupResult<usize> {
        info!("clearing blocks for completed jobs");
        let active_jobs: BTreeSet<_> = self
            .store
            .fetch_queue_entries(|e| !e.status.is_terminal())?
            .into_iter()
            .map(|e| e.job_id)
            .collect();

        let stale = self
            .store
            .fetch_jobs(|job| !job.ineligible_hosts.is_empty() && !active_jobs.contains(&job.id))?;
        for mut job in stale.iter().cloned() {
            debug!(job_id = job.id, blocks = job.ineligible_hosts.len(), "clearing blocks");
            job.ineligible_hosts.clear();
            self.store.save_job(&job)?;
        }
        Ok(stale.len())
    }

    /// Whether the reverify period has elapsed. The first call after startup
    /// is always due.
    pub fn should_reverify_hosts_now(&self, now: Instant) -> bool {
        let Some(period) = self.reverify_period else {
            return false;
        };
        self.last_reverify
            .is_none_or(|last| now.duration_since(last) >= period)
    }

    /// Create Verify tasks for hosts stuck in `RepairFailed`, at most
    /// `reverify_max_hosts_at_once` per pass (0 is unlimited).
    ///
    /// Candidates are taken in ascending host id order starting after the
    /// host picked last, wrapping around, so repeated passes cover every
    /// eligible host. Returns the hosts that got a task.
    pub fn reverify_dead_hosts(&mut self, now: Instant) -> CleanupResult<Vec<HostId>> {
        if !self.should_reverify_hosts_now(now) {
            return Ok(Vec::new());
        }
        self.last_reverify = Some(now);

        let busy = hosts_with_pending_tasks(&self.store)?;
        let eligible = self.store.fetch_hosts(|host| {
            host.status == HostStatus::RepairFailed
                && !host.locked
                && host.protection.permits_verify()
                && !busy.contains(&host.id)
        })?;
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let selected = rotate_and_take(
            &eligible,
            self.reverify_cursor,
            self.reverify_max_hosts_at_once,
        );
        if selected.len() < eligible.len() {
            info!(
                eligible = eligible.len(),
                selected = selected.len(),
                "reverify throttled, remaining hosts wait for a later pass"
            );
        }

        let requested = unix_now();
        for host in &selected {
            info!(hostname = %host.hostname, host_id = host.id, "reverifying dead host");
            self.store.create_special_task(SpecialTask::new(
                host.id,
                SpecialTaskKind::Verify,
                requested,
            ))?;
        }
        if let Some(last) = selected.last() {
            self.reverify_cursor = Some(last.id);
        }
        Ok(selected.iter().map(|h| h.id).collect())
    }
}

impl Cleanup for UserCleanup {
    fn timer(&mut self) -> &mut PeriodicCleanup {
        &mut self.timer
    }

    fn cleanup(&mut self, now: Instant) -> CleanupResult<()> {
        info!("running periodic cleanup");
        let unix = unix_now();
        self.abort_timed_out_jobs(unix)?;
        self.abort_jobs_past_synch_start_timeout(unix)?;
        self.abort_jobs_past_max_runtime(unix)?;
        self.clear_inactive_blocks()?;
        self.check_for_db_inconsistencies()?;
        self.reverify_dead_hosts(now)?;
        Ok(())
    }
}

/// Hosts that already have an incomplete special task of any kind.
pub(crate) fn hosts_with_pending_tasks(store: &StateStore) -> CleanupResult<BTreeSet<HostId>> {
    Ok(store
        .fetch_special_tasks(|t| !t.is_complete)?
        .into_iter()
        .map(|t| t.host_id)
        .collect())
}

/// Hosts after `cursor` in id order, then the ones up to it; first `limit`
/// of those (all when `limit` is 0).
fn rotate_and_take(hosts: &[Host], cursor: Option<HostId>, limit: u32) -> Vec<Host> {
    let split = cursor.map_or(0, |c| hosts.partition_point(|h| h.id <= c));
    let (before, after) = hosts.split_at(split);
    let ordered = after.iter().chain(before);
    let limit = match limit {
        0 => hosts.len(),
        n => n as usize,
    };
    ordered.take(limit).cloned().collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use dronegrid_notify::{EmailNotificationManager, MemoryMailSink};
    use dronegrid_state::{HostQueueEntry, Job, Protection};

    use super::*;

    fn host(hostname: &str, status: HostStatus) -> Host {
        Host {
            id: 0,
            hostname: hostname.to_string(),
            labels: BTreeSet::new(),
            acl_groups: BTreeSet::new(),
            locked: false,
            protection: Protection::NoProtection,
            status,
        }
    }

    fn job(name: &str) -> Job {
        Job {
            id: 0,
            name: name.to_string(),
            owner: "alice".into(),
            priority: 0,
            synch_count: 1,
            dependency_labels: BTreeSet::new(),
            acl_groups: BTreeSet::new(),
            ineligible_hosts: BTreeSet::new(),
            control_file: "control".into(),
            created_at: 0,
            timeout_hours: None,
            max_runtime_hours: None,
        }
    }

    struct Fixture {
        store: StateStore,
        sink: Arc<MemoryMailSink>,
        notifier: Arc<EmailNotificationManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let sink = Arc::new(MemoryMailSink::new());
            let notifier = Arc::new(EmailNotificationManager::new(
                "dronegrid@lab",
                vec!["admins@lab".into()],
                sink.clone(),
            ));
            Self {
                store: StateStore::open_in_memory().unwrap(),
                sink,
                notifier,
            }
        }

        fn cleanup(&self, configure: impl FnOnce(&mut SchedulerConfig)) -> UserCleanup {
            let mut config = SchedulerConfig::default();
            configure(&mut config);
            UserCleanup::new(
                self.store.clone(),
                self.notifier.clone(),
                &config,
                Instant::now(),
            )
        }

        fn verify_tasks(&self) -> Vec<HostId> {
            self.store
                .fetch_special_tasks(|t| t.task == SpecialTaskKind::Verify)
                .unwrap()
                .into_iter()
                .map(|t| t.host_id)
                .collect()
        }

        /// The executor finished every task, hosts still broken.
        fn complete_all_tasks(&self) {
            for mut task in self.store.fetch_special_tasks(|t| !t.is_complete).unwrap() {
                task.is_complete = true;
                self.store.save_special_task(&task).unwrap();
            }
        }
    }

    #[test]
    fn throttled_reverify_rotates_through_all_hosts() {
        let fx = Fixture::new();
        let ids: Vec<HostId> = (1..=6)
            .map(|i| {
                fx.store
                    .create_host(host(&format!("host{i}"), HostStatus::RepairFailed))
                    .unwrap()
                    .id
            })
            .collect();
        let mut cleanup = fx.cleanup(|c| {
            c.scheduler.reverify_max_hosts_at_once = 2;
            c.scheduler.reverify_period_minutes = 30;
        });

        let start = Instant::now();
        let period = Duration::from_secs(30 * 60);
        let mut covered = Vec::new();
        for cycle in 0..3u32 {
            let picked = cleanup.reverify_dead_hosts(start + period * cycle).unwrap();
            assert_eq!(picked.len(), 2, "cycle {cycle}");
            covered.extend(picked);
            fx.complete_all_tasks();
        }
        assert_eq!(covered, ids);
        assert_eq!(fx.verify_tasks().len(), 6);

        // Fourth cycle wraps around to the lowest ids.
        let picked = cleanup.reverify_dead_hosts(start + period * 3).unwrap();
        assert_eq!(picked, ids[..2].to_vec());
    }

    #[test]
    fn reverify_respects_period() {
        let fx = Fixture::new();
        fx.store.create_host(host("h1", HostStatus::RepairFailed)).unwrap();
        let mut cleanup = fx.cleanup(|c| c.scheduler.reverify_period_minutes = 10);

        let start = Instant::now();
        assert_eq!(cleanup.reverify_dead_hosts(start).unwrap().len(), 1);
        fx.complete_all_tasks();
        assert!(cleanup.reverify_dead_hosts(start + Duration::from_secs(60)).unwrap().is_empty());
        assert_eq!(
            cleanup
                .reverify_dead_hosts(start + Duration::from_secs(600))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn zero_period_disables_reverify() {
        let fx = Fixture::new();
        fx.store.create_host(host("h1", HostStatus::RepairFailed)).unwrap();
        let mut cleanup = fx.cleanup(|c| c.scheduler.reverify_period_minutes = 0);
        assert!(cleanup.reverify_dead_hosts(Instant::now()).unwrap().is_empty());
        assert!(fx.verify_tasks().is_empty());
    }

    #[test]
    fn reverify_skips_locked_protected_busy_and_healthy_hosts() {
        let fx = Fixture::new();
        let mut locked = host("locked", HostStatus::RepairFailed);
        locked.locked = true;
        fx.store.create_host(locked).unwrap();
        let mut protected = host("protected", HostStatus::RepairFailed);
        protected.protection = Protection::DoNotVerify;
        fx.store.create_host(protected).unwrap();
        let busy = fx.store.create_host(host("busy", HostStatus::RepairFailed)).unwrap();
        fx.store
            .create_special_task(SpecialTask::new(busy.id, SpecialTaskKind::Repair, 0))
            .unwrap();
        fx.store.create_host(host("ready", HostStatus::Ready)).unwrap();
        let dead = fx.store.create_host(host("dead", HostStatus::RepairFailed)).unwrap();

        let mut cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.reverify_dead_hosts(Instant::now()).unwrap(), vec![dead.id]);
        assert_eq!(fx.verify_tasks(), vec![dead.id]);
    }

    #[test]
    fn unlimited_throttle_takes_everyone() {
        let fx = Fixture::new();
        for i in 0..4 {
            fx.store
                .create_host(host(&format!("h{i}"), HostStatus::RepairFailed))
                .unwrap();
        }
        let mut cleanup = fx.cleanup(|c| c.scheduler.reverify_max_hosts_at_once = 0);
        assert_eq!(cleanup.reverify_dead_hosts(Instant::now()).unwrap().len(), 4);
    }

    #[test]
    fn inconsistencies_are_emailed_and_truncated() {
        let fx = Fixture::new();
        let job = fx.store.create_job(job("j")).unwrap();
        for _ in 0..55 {
            let mut entry = HostQueueEntry::for_label(job.id, 1);
            entry.status = EntryStatus::Running;
            fx.store.create_queue_entry(entry).unwrap();
        }
        let mut fine = HostQueueEntry::for_host(job.id, 1);
        fine.status = EntryStatus::Running;
        fx.store.create_queue_entry(fine).unwrap();

        let cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.check_for_db_inconsistencies().unwrap(), 55);
        fx.notifier.send_queued_emails().unwrap();

        let sent = fx.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("55 queue entries"));
        assert!(sent[0].body.ends_with("(truncated)\n"));
        assert_eq!(sent[0].body.matches("hqe ").count(), 50);
    }

    #[test]
    fn blocks_cleared_only_for_finished_jobs() {
        let fx = Fixture::new();
        let mut finished = job("finished");
        finished.ineligible_hosts = [3, 4].into();
        let finished = fx.store.create_job(finished).unwrap();
        let mut done = HostQueueEntry::for_host(finished.id, 3);
        done.status = EntryStatus::Completed;
        fx.store.create_queue_entry(done).unwrap();

        let mut running = job("running");
        running.ineligible_hosts = [5].into();
        let running = fx.store.create_job(running).unwrap();
        fx.store
            .create_queue_entry(HostQueueEntry::for_label(running.id, 1))
            .unwrap();

        let cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.clear_inactive_blocks().unwrap(), 1);
        assert!(
            fx.store
                .require_job(finished.id)
                .unwrap()
                .ineligible_hosts
                .is_empty()
        );
        assert_eq!(fx.store.require_job(running.id).unwrap().ineligible_hosts.len(), 1);
    }

    #[test]
    fn full_pass_runs_on_interval() {
        let fx = Fixture::new();
        fx.store.create_host(host("h1", HostStatus::RepairFailed)).unwrap();
        let start = Instant::now();
        let mut config = SchedulerConfig::default();
        config.scheduler.clean_interval_minutes = 1;
        let mut cleanup = UserCleanup::new(fx.store.clone(), fx.notifier.clone(), &config, start);

        cleanup.initialize(start).unwrap();
        assert!(fx.verify_tasks().is_empty());
        assert!(cleanup.run_cleanup_maybe(start + Duration::from_secs(61)).unwrap());
        assert_eq!(fx.verify_tasks().len(), 1);
    }

    fn entry_with(
        store: &StateStore,
        mut entry: HostQueueEntry,
        status: EntryStatus,
    ) -> HostQueueEntry {
        entry.status = status;
        store.create_queue_entry(entry).unwrap()
    }

    fn status_of(store: &StateStore, entry: &HostQueueEntry) -> EntryStatus {
        store.get_queue_entry(entry.id).unwrap().unwrap().status
    }

    #[test]
    fn timed_out_jobs_abort_unfinished_entries() {
        let fx = Fixture::new();
        let mut expired = job("expired");
        expired.timeout_hours = Some(1);
        let expired = fx.store.create_job(expired).unwrap();
        let mut patient = job("patient");
        patient.timeout_hours = Some(10);
        let patient = fx.store.create_job(patient).unwrap();
        let forever = fx.store.create_job(job("forever")).unwrap();
        let put = |entry, status| entry_with(&fx.store, entry, status);

        let running = put(HostQueueEntry::for_host(expired.id, 1), EntryStatus::Running);
        let queued = put(HostQueueEntry::for_label(expired.id, 1), EntryStatus::Queued);
        let done = put(HostQueueEntry::for_host(expired.id, 2), EntryStatus::Completed);
        let waiting = put(HostQueueEntry::for_label(patient.id, 1), EntryStatus::Queued);
        let untimed = put(HostQueueEntry::for_label(forever.id, 1), EntryStatus::Queued);

        let cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.abort_timed_out_jobs(2 * 3600).unwrap(), vec![expired.id]);
        assert_eq!(status_of(&fx.store, &running), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &queued), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &done), EntryStatus::Completed);
        assert_eq!(status_of(&fx.store, &waiting), EntryStatus::Queued);
        assert_eq!(status_of(&fx.store, &untimed), EntryStatus::Queued);

        // nothing left to abort
        assert!(cleanup.abort_timed_out_jobs(2 * 3600).unwrap().is_empty());
    }

    #[test]
    fn stalled_synchronous_jobs_abort_entries_not_yet_running() {
        let fx = Fixture::new();
        let mut stalled = job("stalled");
        stalled.synch_count = 2;
        let stalled = fx.store.create_job(stalled).unwrap();
        let mut partly = job("partly");
        partly.synch_count = 2;
        let partly = fx.store.create_job(partly).unwrap();
        let mut young = job("young");
        young.synch_count = 2;
        young.created_at = 7000;
        let young = fx.store.create_job(young).unwrap();
        let single = fx.store.create_job(job("single")).unwrap();
        let put = |entry, status| entry_with(&fx.store, entry, status);

        let holding = put(HostQueueEntry::for_host(stalled.id, 1), EntryStatus::Scheduled);
        let pending = put(HostQueueEntry::for_label(stalled.id, 1), EntryStatus::Queued);
        let started = put(HostQueueEntry::for_host(partly.id, 2), EntryStatus::Running);
        let straggler = put(HostQueueEntry::for_host(partly.id, 3), EntryStatus::Scheduled);
        let fresh = put(HostQueueEntry::for_host(young.id, 4), EntryStatus::Scheduled);
        let alone = put(HostQueueEntry::for_host(single.id, 5), EntryStatus::Scheduled);

        let cleanup = fx.cleanup(|c| c.scheduler.synch_job_start_timeout_minutes = 60);
        let aborted = cleanup.abort_jobs_past_synch_start_timeout(7200).unwrap();
        assert_eq!(aborted, vec![stalled.id, partly.id]);
        assert_eq!(status_of(&fx.store, &holding), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &pending), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &started), EntryStatus::Running);
        assert_eq!(status_of(&fx.store, &straggler), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &fresh), EntryStatus::Scheduled);
        assert_eq!(status_of(&fx.store, &alone), EntryStatus::Scheduled);

        let disabled = fx.cleanup(|c| c.scheduler.synch_job_start_timeout_minutes = 0);
        assert!(disabled.abort_jobs_past_synch_start_timeout(u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn entries_past_max_runtime_are_aborted() {
        let fx = Fixture::new();
        let mut bounded = job("bounded");
        bounded.max_runtime_hours = Some(1);
        let bounded = fx.store.create_job(bounded).unwrap();
        let unbounded = fx.store.create_job(job("unbounded")).unwrap();

        let mut overdue = HostQueueEntry::for_host(bounded.id, 1);
        overdue.started_at = Some(100);
        let overdue = entry_with(&fx.store, overdue, EntryStatus::Running);
        let mut recent = HostQueueEntry::for_host(bounded.id, 2);
        recent.started_at = Some(3000);
        let recent = entry_with(&fx.store, recent, EntryStatus::Running);
        let mut long = HostQueueEntry::for_host(unbounded.id, 3);
        long.started_at = Some(0);
        let long = entry_with(&fx.store, long, EntryStatus::Running);

        let cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.abort_jobs_past_max_runtime(100 + 3601).unwrap(), 1);
        assert_eq!(status_of(&fx.store, &overdue), EntryStatus::Aborted);
        assert_eq!(status_of(&fx.store, &recent), EntryStatus::Running);
        assert_eq!(status_of(&fx.store, &long), EntryStatus::Running);
    }

    #[test]
    fn hostless_entries_are_not_inconsistent() {
        let fx = Fixture::new();
        let job = fx.store.create_job(job("hostless")).unwrap();
        entry_with(&fx.store, HostQueueEntry::hostless(job.id), EntryStatus::Running);
        let cleanup = fx.cleanup(|_| {});
        assert_eq!(cleanup.check_for_db_inconsistencies().unwrap(), 0);
    }

    #[test]
    fn rotation_wraps_after_cursor() {
        let hosts: Vec<Host> = [2, 4, 6, 8]
            .iter()
            .map(|&id| Host {
                id,
                ..host("h", HostStatus::RepairFailed)
            })
            .collect();
        let ids = |hs: Vec<Host>| hs.into_iter().map(|h| h.id).collect::<Vec<_>>();
        assert_eq!(ids(rotate_and_take(&hosts, None, 3)), vec![2, 4, 6]);
        assert_eq!(ids(rotate_and_take(&hosts, Some(4), 3)), vec![6, 8, 2]);
        assert_eq!(ids(rotate_and_take(&hosts, Some(5), 0)), vec![6, 8, 2, 4]);
        assert_eq!(ids(rotate_and_take(&hosts, Some(9), 1)), vec![2]);
    }
}
