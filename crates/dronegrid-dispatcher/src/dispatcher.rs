//! The scheduler tick loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dronegrid_cleanup::{
    Cleanup, TwentyFourHourUpkeep, UserCleanup, recover_hosts, reverify_remaining_hosts,
};
use dronegrid_config::{ConfigSource, SchedulerConfig};
use dronegrid_drones::{
    CompletedExecution, DispatchRequest, DroneManager, ExecuteReport, RefreshReport,
    TransportFactory,
};
use dronegrid_notify::Notifier;
use dronegrid_scheduler::{HostScheduler, ScheduleOutcome, SchedulerError};
use dronegrid_state::{
    AtomicGroupId, EntryId, EntryStatus, ExecutionRef, HostQueueEntry, Job, JobId, StateStore,
};
use dronegrid_status::{ReconfigureRequest, StatusSnapshot, StatusState};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, DispatchResult};

/// Entries that must start together: every entry of one job's atomic group,
/// or a single entry otherwise. Orders by job first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LaunchKey {
    job_id: JobId,
    unit: LaunchUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LaunchUnit {
    Group(AtomicGroupId),
    Single(EntryId),
}

impl LaunchKey {
    fn of(entry: &HostQueueEntry) -> Self {
        let unit = match entry.atomic_group_id {
            Some(group) => LaunchUnit::Group(group),
            None => LaunchUnit::Single(entry.id),
        };
        Self {
            job_id: entry.job_id,
            unit,
        }
    }
}

/// Results subdirectory of hostless executions.
const HOSTLESS_SUBDIR: &str = "hostless";

/// Execution tag for a job launched with `hostname` as its first host.
///
/// The tag names the results directory, so it must be unique among live
/// executions.
pub fn execution_tag(job: &Job, hostname: &str) -> String {
    format!("{}-{}/{}", job.id, job.owner, hostname)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct Dispatcher {
    store: StateStore,
    config: ConfigSource,
    notifier: Arc<dyn Notifier>,
    host_scheduler: HostScheduler,
    drones: DroneManager,
    user_cleanup: UserCleanup,
    upkeep: TwentyFourHourUpkeep,
    reconfigure_tx: mpsc::Sender<ReconfigureRequest>,
    reconfigure_rx: mpsc::Receiver<ReconfigureRequest>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    ticks: u64,
    last_error: Option<String>,
}

impl Dispatcher {
    /// Build a dispatcher over `store`. Fails when the configuration
    /// disables the scheduler or names no drones.
    pub fn new(
        store: StateStore,
        config: ConfigSource,
        notifier: Arc<dyn Notifier>,
        factory: TransportFactory,
    ) -> DispatchResult<Self> {
        let current = config.current();
        if !current.scheduler.enable_scheduler {
            return Err(DispatchError::SchedulerDisabled);
        }
        let now = std::time::Instant::now();
        let drones = DroneManager::new(current, factory)?;
        let user_cleanup = UserCleanup::new(store.clone(), notifier.clone(), current, now);
        let upkeep = TwentyFourHourUpkeep::new(
            store.clone(),
            current.scheduler.special_task_retention_days,
            now,
        );
        let (reconfigure_tx, reconfigure_rx) = mpsc::channel(1);
        let (snapshot_tx, _) = watch::channel(StatusSnapshot::default());
        info!(drones = current.drones.len(), dark_mark = %drones.dark_mark(), "dispatcher created");

        Ok(Self {
            store,
            config,
            notifier,
            host_scheduler: HostScheduler::new(),
            drones,
            user_cleanup,
            upkeep,
            reconfigure_tx,
            reconfigure_rx,
            snapshot_tx,
            ticks: 0,
            last_error: None,
        })
    }

    /// Handles for the status server.
    pub fn status_state(&self) -> StatusState {
        StatusState {
            snapshot: self.snapshot_tx.subscribe(),
            reconfigure: self.reconfigure_tx.clone(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn drones(&self) -> &DroneManager {
        &self.drones
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.config.current()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Startup work before the first tick.
    ///
    /// Executions recorded as running are re-attached to their drones so
    /// their capacity is counted, and processes nobody accounts for are
    /// reported. Hosts left mid-task with nothing running on them get a
    /// cleanup task. With `recover`, so do hosts stuck in repair.
    pub async fn initialize(&mut self, recover: bool) -> DispatchResult<()> {
        info!(recover_hosts = recover, "initializing dispatcher");
        let now = std::time::Instant::now();
        self.user_cleanup.initialize(now)?;
        self.upkeep.initialize(now)?;

        self.reattach_executions()?;
        let deadline = Instant::now() + self.config.current().tick_timeout();
        let refresh = self.drones.refresh(deadline).await;
        self.handle_refresh(&refresh)?;
        self.report_orphans();

        let stuck = reverify_remaining_hosts(&self.store)?;
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "queued cleanup for hosts left mid-task");
        }
        if recover {
            let hosts = recover_hosts(&self.store, self.notifier.as_ref())?;
            info!(count = hosts.len(), "queued cleanup for repair-failed hosts");
        }
        self.send_queued_emails();
        self.publish_snapshot()?;
        Ok(())
    }

    /// One scheduler cycle.
    pub async fn tick(&mut self) -> DispatchResult<()> {
        self.ticks += 1;
        self.last_error = None;
        let started = Instant::now();
        let deadline = started + self.config.current().tick_timeout();
        debug!(tick = self.ticks, "tick starting");

        self.handle_reconfigure_requests();

        let refresh = self.drones.refresh(deadline).await;
        if !refresh.unreachable.is_empty() {
            warn!(drones = ?refresh.unreachable, "drones unreachable this tick");
        }
        self.handle_refresh(&refresh)?;
        self.handle_aborts()?;

        let now = started.into_std();
        self.user_cleanup.run_cleanup_maybe(now)?;
        self.upkeep.run_cleanup_maybe(now)?;

        let scheduled = self.schedule_new_jobs()?;
        let launched = self.dispatch_scheduled_entries()?;
        let report = self.drones.execute_actions(deadline).await;
        self.handle_execute_report(report)?;

        self.send_queued_emails();
        self.publish_snapshot()?;
        debug!(
            tick = self.ticks,
            scheduled,
            launched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick finished"
        );
        Ok(())
    }

    /// Tick until `shutdown` flips to true or its sender goes away. A failed
    /// tick is reported on the status page and by email; the next one still
    /// runs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_pause_secs = self.config.current().scheduler.tick_pause_secs,
            "dispatcher running"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(tick = self.ticks, error = %e, "tick failed");
                self.last_error = Some(e.to_string());
                self.notifier
                    .enqueue_notify_email("Scheduler tick failed", &e.to_string());
                self.send_queued_emails();
                if let Err(e) = self.publish_snapshot() {
                    warn!(error = %e, "cannot publish status snapshot");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.current().tick_pause()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.send_queued_emails();
        info!(ticks = self.ticks, "dispatcher stopped");
    }

    // ── startup ──────────────────────────────────────────────────

    fn reattach_executions(&mut self) -> DispatchResult<()> {
        let running = self
            .store
            .fetch_queue_entries(|e| e.status == EntryStatus::Running)?;
        let mut by_tag: BTreeMap<String, (ExecutionRef, u32)> = BTreeMap::new();
        for entry in &running {
            let Some(execution) = &entry.execution else {
                warn!(%entry, "running entry has no execution recorded");
                continue;
            };
            by_tag
                .entry(execution.tag.clone())
                .and_modify(|(_, count)| *count += 1)
                .or_insert_with(|| (execution.clone(), 1));
        }
        for (tag, (execution, count)) in by_tag {
            if let Err(e) =
                self.drones
                    .register_execution(&tag, &execution.drone, execution.pid, count)
            {
                error!(%tag, error = %e, "cannot re-attach execution");
                self.notifier
                    .enqueue_notify_email(&format!("Cannot recover execution {tag}"), &e.to_string());
            }
        }
        Ok(())
    }

    fn report_orphans(&self) {
        let orphans = self.drones.orphaned_processes();
        if orphans.is_empty() {
            return;
        }
        warn!(count = orphans.len(), "orphaned processes found");
        let message = orphans
            .iter()
            .map(|(drone, p)| format!("{drone}: pid {} {}", p.pid, p.args))
            .collect::<Vec<_>>()
            .join("\n");
        self.notifier.enqueue_notify_email(
            &format!("{} orphaned processes found", orphans.len()),
            &message,
        );
    }

    // ── tick phases ──────────────────────────────────────────────

    fn handle_reconfigure_requests(&mut self) {
        let mut requested = false;
        while self.reconfigure_rx.try_recv().is_ok() {
            requested = true;
        }
        if !requested {
            return;
        }
        match self.config.reload().cloned() {
            Ok(config) => {
                self.apply_config(&config);
                info!("configuration reparsed");
            }
            Err(e) => {
                self.notifier
                    .enqueue_notify_email("Configuration reparse failed", &e.to_string());
            }
        }
    }

    fn apply_config(&mut self, config: &SchedulerConfig) {
        if !config.scheduler.enable_scheduler {
            warn!("enable_scheduler is only read at startup");
        }
        self.drones.refresh_drone_configs(config);
        self.user_cleanup.apply_config(config);
        self.upkeep
            .set_retention_days(config.scheduler.special_task_retention_days);
        self.notifier.set_recipients(
            &config.scheduler.notify_email_from,
            &config.scheduler.notify_email_to,
        );
    }

    fn handle_refresh(&mut self, refresh: &RefreshReport) -> DispatchResult<()> {
        self.handle_completions(&refresh.completed)?;
        for adopted in &refresh.adopted {
            info!(tag = %adopted.tag, drone = %adopted.drone, pid = adopted.pid, "unconfirmed start found running");
            self.record_pid(&adopted.tag, adopted.pid)?;
        }
        for tag in &refresh.lost {
            self.reschedule(tag, "no process after an unconfirmed start")?;
        }
        Ok(())
    }

    fn handle_completions(&mut self, completed: &[CompletedExecution]) -> DispatchResult<()> {
        if completed.is_empty() {
            return Ok(());
        }
        let tags: BTreeSet<&str> = completed.iter().map(|c| c.tag.as_str()).collect();
        let mut entries = self.store.fetch_queue_entries(|e| {
            e.status == EntryStatus::Running
                && e.execution
                    .as_ref()
                    .is_some_and(|x| tags.contains(x.tag.as_str()))
        })?;
        for entry in &mut entries {
            entry.status = EntryStatus::Completed;
            info!(%entry, "entry completed");
        }
        self.store.save_queue_entries(&entries)?;
        Ok(())
    }

    /// Kill the processes of aborted entries and forget their executions.
    fn handle_aborts(&mut self) -> DispatchResult<()> {
        let aborted = self
            .store
            .fetch_queue_entries(|e| e.status == EntryStatus::Aborted && e.execution.is_some())?;
        let mut killed = BTreeSet::new();
        for mut entry in aborted {
            let Some(tag) = entry.execution.as_ref().map(|x| x.tag.clone()) else {
                continue;
            };
            match self.drones.execution(&tag).map(|x| (x.drone.clone(), x.pid)) {
                // Not started yet; kill it once the drone reports a pid.
                Some((_, None)) => continue,
                Some((drone, Some(pid))) => {
                    if killed.insert(tag.clone()) {
                        info!(%entry, %drone, pid, "killing aborted execution");
                        self.drones.kill_process(&drone, pid)?;
                    }
                }
                None => {}
            }
            entry.execution = None;
            self.store.save_queue_entry(&entry)?;
        }
        Ok(())
    }

    /// Match pending entries to hosts. Returns the number of entries that
    /// got a host.
    fn schedule_new_jobs(&mut self) -> DispatchResult<usize> {
        let pending = self.store.pending_queue_entries()?;
        if pending.is_empty() {
            return Ok(0);
        }
        let mut pool = self.host_scheduler.refresh(&self.store, &pending)?;
        let mut scheduled = 0;
        for mut entry in pending {
            match self.host_scheduler.schedule_entry(&mut entry, &mut pool) {
                Ok(ScheduleOutcome::Deferred) => {}
                Ok(ScheduleOutcome::Assigned { extra_hosts }) => {
                    entry.status = EntryStatus::Scheduled;
                    self.store.save_queue_entry(&entry)?;
                    info!(%entry, "entry scheduled");
                    scheduled += 1;
                    for host_id in extra_hosts {
                        let sibling = self.store.create_queue_entry(entry.clone_for_host(host_id))?;
                        info!(entry = %sibling, "atomic group entry scheduled");
                        scheduled += 1;
                    }
                }
                Ok(ScheduleOutcome::Aborted) => {
                    self.store.save_queue_entry(&entry)?;
                    warn!(%entry, "entry aborted by scheduler");
                    self.notifier.enqueue_notify_email(
                        &format!("Aborted {entry}"),
                        "the job cannot ever be satisfied by its atomic group",
                    );
                }
                Err(SchedulerError::State(e)) => return Err(e.into()),
                Err(
                    e @ (SchedulerError::NoMetahostScheduler(_)
                    | SchedulerError::AtomicGroupNotFound(_)
                    | SchedulerError::JobNotFound(_)),
                ) => {
                    // Retrying cannot help; settle it once.
                    error!(%entry, error = %e, "entry can never be scheduled, aborting");
                    entry.status = EntryStatus::Aborted;
                    self.store.save_queue_entry(&entry)?;
                }
                Err(e) => error!(%entry, error = %e, "cannot schedule entry"),
            }
        }
        Ok(scheduled)
    }

    /// Queue process starts for scheduled entries in job order. Returns the
    /// number of processes queued.
    ///
    /// The first launch of a cycle may exceed the per-cycle limit. Once a
    /// launch misses the limit or drone capacity, nothing after it starts
    /// this cycle, so a large launch is never starved by smaller ones.
    fn dispatch_scheduled_entries(&mut self) -> DispatchResult<u32> {
        let limit = self.config.current().scheduler.max_processes_started_per_cycle;
        let waiting = self
            .store
            .fetch_queue_entries(|e| e.status == EntryStatus::Scheduled && e.execution.is_none())?;
        let mut launches: BTreeMap<LaunchKey, Vec<HostQueueEntry>> = BTreeMap::new();
        for entry in waiting {
            launches.entry(LaunchKey::of(&entry)).or_default().push(entry);
        }

        let mut started = 0u32;
        for (key, mut entries) in launches {
            let processes = entries.len() as u32;
            let Some(job) = self.store.get_job(key.job_id)? else {
                error!(job_id = key.job_id, "scheduled entries reference a missing job, aborting");
                for entry in &mut entries {
                    entry.status = EntryStatus::Aborted;
                }
                self.store.save_queue_entries(&entries)?;
                continue;
            };
            if self.drones.max_runnable_processes(&job.owner, None) < processes {
                debug!(job_id = job.id, processes, "no drone capacity, holding the queue");
                break;
            }
            if started > 0 && started + processes > limit {
                info!(limit, started, "per-cycle start limit reached");
                break;
            }
            let Some(hostnames) = self.hostnames_for(&entries)? else {
                continue;
            };

            let first = hostnames.first().map_or(HOSTLESS_SUBDIR, String::as_str);
            let tag = execution_tag(&job, first);
            let request = DispatchRequest {
                tag: tag.clone(),
                command: self.process_command(&job, &tag, &hostnames),
                username: job.owner.clone(),
                allowed_drones: None,
                num_processes: processes,
            };
            let drone = match self.drones.execute_command(request) {
                Ok(Some(drone)) => drone,
                Ok(None) => break,
                Err(e) => {
                    warn!(%tag, error = %e, "cannot dispatch execution");
                    continue;
                }
            };
            let now = unix_now();
            for entry in &mut entries {
                entry.status = EntryStatus::Running;
                entry.started_at = Some(now);
                entry.execution = Some(ExecutionRef {
                    tag: tag.clone(),
                    drone: drone.clone(),
                    pid: None,
                });
            }
            self.store.save_queue_entries(&entries)?;
            info!(%tag, %drone, job_id = job.id, hosts = %hostnames.join(","), "execution dispatched");
            started += processes;
        }
        Ok(started)
    }

    /// Hostnames of `entries`, or `None` if any entry lost its host.
    /// Hostless entries contribute none.
    fn hostnames_for(&self, entries: &[HostQueueEntry]) -> DispatchResult<Option<Vec<String>>> {
        let mut hostnames = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_hostless() {
                continue;
            }
            let host = match entry.host_id {
                Some(id) => self.store.get_host(id)?,
                None => None,
            };
            match host {
                Some(host) => hostnames.push(host.hostname),
                None => {
                    error!(%entry, "scheduled entry has no host");
                    return Ok(None);
                }
            }
        }
        Ok(Some(hostnames))
    }

    fn process_command(&self, job: &Job, tag: &str, hostnames: &[String]) -> Vec<String> {
        let scheduler = &self.config.current().scheduler;
        let mut command = vec![
            scheduler.process_command_name.clone(),
            "-p".to_string(),
            "-r".to_string(),
            scheduler.results_dir.join(tag).display().to_string(),
        ];
        if !hostnames.is_empty() {
            command.extend(["-m".to_string(), hostnames.join(",")]);
        }
        command.extend([
            "-u".to_string(),
            job.owner.clone(),
            "-l".to_string(),
            job.name.clone(),
            job.control_file.clone(),
        ]);
        command
    }

    fn handle_execute_report(&mut self, report: ExecuteReport) -> DispatchResult<()> {
        for started in report.started {
            self.record_pid(&started.tag, started.pid)?;
            debug!(tag = %started.tag, drone = %started.drone, pid = started.pid, "execution started");
        }
        if !report.unconfirmed.is_empty() {
            // Entries stay Running without a pid until the next refresh.
            warn!(tags = ?report.unconfirmed, "start not confirmed, settling on next refresh");
        }
        for failed in report.failed {
            let Some(tag) = failed.tag else {
                warn!(error = %failed.error, "drone call failed");
                continue;
            };
            warn!(%tag, error = %failed.error, "execution did not start, will retry");
            self.reschedule(&tag, "start failed")?;
        }
        Ok(())
    }

    fn record_pid(&self, tag: &str, pid: u32) -> DispatchResult<()> {
        let mut entries = self.running_entries_with_tag(tag)?;
        for entry in &mut entries {
            if let Some(execution) = entry.execution.as_mut() {
                execution.pid = Some(pid);
            }
        }
        self.store.save_queue_entries(&entries)?;
        Ok(())
    }

    /// Put the running entries of `tag` back in line for dispatch.
    fn reschedule(&self, tag: &str, reason: &str) -> DispatchResult<()> {
        let mut entries = self.running_entries_with_tag(tag)?;
        for entry in &mut entries {
            entry.status = EntryStatus::Scheduled;
            entry.execution = None;
            entry.started_at = None;
        }
        self.store.save_queue_entries(&entries)?;
        info!(%tag, reason, entries = entries.len(), "execution rescheduled");
        Ok(())
    }

    fn running_entries_with_tag(&self, tag: &str) -> DispatchResult<Vec<HostQueueEntry>> {
        Ok(self.store.fetch_queue_entries(|e| {
            e.status == EntryStatus::Running
                && e.execution.as_ref().is_some_and(|x| x.tag == tag)
        })?)
    }

    // ── reporting ────────────────────────────────────────────────

    fn send_queued_emails(&self) {
        if let Err(e) = self.notifier.send_queued_emails() {
            error!(error = %e, "failed to send notification emails");
        }
    }

    fn publish_snapshot(&self) -> DispatchResult<()> {
        let live = self.store.fetch_queue_entries(|e| !e.status.is_terminal())?;
        let snapshot = StatusSnapshot {
            tick: self.ticks,
            updated_at: unix_now(),
            config: self.config.current().describe(),
            drones: self.drones.drone_summaries(),
            queued_entries: live
                .iter()
                .filter(|e| e.status == EntryStatus::Queued)
                .count(),
            active_entries: live.iter().filter(|e| e.status.holds_host()).count(),
            total_running_processes: self.drones.total_running_processes(),
            last_error: self.last_error.clone(),
        };
        self.snapshot_tx.send_replace(snapshot);
        Ok(())
    }
}
