//! DroneManager — drone capacity, execution tracking and the tick fan-out.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dronegrid_config::SchedulerConfig;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::drone::{Drone, DroneCall, DroneSummary, compare_load};
use crate::error::{DroneError, DroneResult};
use crate::process::{ProcessRecord, select_owned};
use crate::transport::{DroneTransport, ExecuteRequest, TransportFactory};

/// A request to run one command somewhere in the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Unique execution tag; also names the results directory.
    pub tag: String,
    pub command: Vec<String>,
    /// Job owner, checked against each drone's user list.
    pub username: String,
    /// Restrict placement to these drones.
    pub allowed_drones: Option<BTreeSet<String>>,
    pub num_processes: u32,
}

/// Where a tracked execution is in its life. Every state holds capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Queued for the next `execute_actions`.
    Pending,
    /// The start call timed out. The process may or may not exist; the next
    /// process-table read decides.
    Unconfirmed,
    Started,
}

/// A tracked execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub tag: String,
    pub drone: String,
    pub pid: Option<u32>,
    pub num_processes: u32,
    pub state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedExecution {
    pub tag: String,
    pub drone: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedExecution {
    pub tag: String,
    pub drone: String,
    pub pid: Option<u32>,
}

/// A queued call that failed, timed out or missed the deadline.
#[derive(Debug)]
pub struct FailedCall {
    /// Set for execute calls; kill failures carry no tag.
    pub tag: Option<String>,
    pub error: DroneError,
}

#[derive(Debug, Default)]
pub struct ExecuteReport {
    pub started: Vec<StartedExecution>,
    /// Start calls that timed out. Their executions stay reserved until a
    /// refresh finds or misses the process.
    pub unconfirmed: Vec<String>,
    pub failed: Vec<FailedCall>,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub completed: Vec<CompletedExecution>,
    /// Unconfirmed starts whose process showed up.
    pub adopted: Vec<StartedExecution>,
    /// Unconfirmed starts with no process; their capacity is released.
    pub lost: Vec<String>,
    pub unreachable: Vec<String>,
}

#[derive(Debug, Clone)]
struct Settings {
    command_name: String,
    check_dark_mark: bool,
    drone_timeout: Duration,
    results_dir: PathBuf,
}

impl Settings {
    fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            command_name: config.scheduler.process_command_name.clone(),
            check_dark_mark: config.scheduler.check_processes_for_dark_mark,
            drone_timeout: config.drone_timeout(),
            results_dir: config.scheduler.results_dir.clone(),
        }
    }
}

/// Owns every drone and the executions running on them.
///
/// Capacity is accounted from tracked executions, so a drone never receives
/// more work than `max_processes` allows even when its process table is
/// temporarily unreadable.
pub struct DroneManager {
    drones: BTreeMap<String, Drone>,
    executions: BTreeMap<String, Execution>,
    /// Owned processes from each drone's last successful read.
    processes: BTreeMap<String, Vec<ProcessRecord>>,
    factory: TransportFactory,
    settings: Settings,
    dark_mark: String,
}

impl DroneManager {
    pub fn new(config: &SchedulerConfig, factory: TransportFactory) -> DroneResult<Self> {
        if config.drones.is_empty() {
            return Err(DroneError::NoDrones);
        }
        let mut manager = Self {
            drones: BTreeMap::new(),
            executions: BTreeMap::new(),
            processes: BTreeMap::new(),
            factory,
            settings: Settings::from_config(config),
            dark_mark: std::process::id().to_string(),
        };
        manager.refresh_drone_configs(config);
        Ok(manager)
    }

    /// Value stamped into [`crate::DARK_MARK_ENV`] on spawned processes.
    pub fn dark_mark(&self) -> &str {
        &self.dark_mark
    }

    /// Apply drone sections and scheduler options from a (re)loaded config.
    ///
    /// Lowering `max_processes` below the current load only stops new
    /// dispatch; running processes are left alone.
    pub fn refresh_drone_configs(&mut self, config: &SchedulerConfig) {
        self.settings = Settings::from_config(config);

        for (hostname, drone_config) in &config.drones {
            let drone = self.drones.entry(hostname.clone()).or_insert_with(|| {
                info!(drone = %hostname, transport = ?drone_config.transport, "adding drone");
                Drone::new(hostname.clone(), (self.factory)(hostname, drone_config))
            });
            drone.enabled = !drone_config.disabled;
            drone.max_processes = config.drone_max_processes(hostname);
            drone.allowed_users = drone_config.users.clone();
        }

        let removed: Vec<String> = self
            .drones
            .keys()
            .filter(|hostname| !config.drones.contains_key(*hostname))
            .cloned()
            .collect();
        for hostname in removed {
            if self.executions.values().any(|e| e.drone == hostname) {
                warn!(drone = %hostname, "drone removed from config while busy, disabling");
                if let Some(drone) = self.drones.get_mut(&hostname) {
                    drone.enabled = false;
                }
            } else {
                info!(drone = %hostname, "removing drone");
                self.drones.remove(&hostname);
                self.processes.remove(&hostname);
            }
        }
    }

    pub fn drone(&self, hostname: &str) -> Option<&Drone> {
        self.drones.get(hostname)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn execution(&self, tag: &str) -> Option<&Execution> {
        self.executions.get(tag)
    }

    pub fn active_processes(&self, hostname: &str) -> u32 {
        self.executions
            .values()
            .filter(|e| e.drone == hostname)
            .map(|e| e.num_processes)
            .sum()
    }

    pub fn total_running_processes(&self) -> u32 {
        self.executions.values().map(|e| e.num_processes).sum()
    }

    fn candidates<'a>(
        &'a self,
        username: &'a str,
        allowed_drones: Option<&'a BTreeSet<String>>,
    ) -> impl Iterator<Item = (&'a Drone, u32)> + 'a {
        self.drones
            .values()
            .filter(move |d| d.enabled && d.reachable && d.usable_by(username))
            .filter(move |d| allowed_drones.is_none_or(|allowed| allowed.contains(&d.hostname)))
            .map(move |d| (d, self.active_processes(&d.hostname)))
    }

    /// Largest process count a single dispatch for `username` could get.
    pub fn max_runnable_processes(
        &self,
        username: &str,
        allowed_drones: Option<&BTreeSet<String>>,
    ) -> u32 {
        self.candidates(username, allowed_drones)
            .map(|(drone, active)| drone.max_processes.saturating_sub(active))
            .max()
            .unwrap_or(0)
    }

    /// Choose a drone, reserve capacity and queue the start.
    ///
    /// Returns the chosen hostname, or `None` when no drone has room; the
    /// caller retries on a later tick.
    pub fn execute_command(&mut self, request: DispatchRequest) -> DroneResult<Option<String>> {
        if self.executions.contains_key(&request.tag) {
            return Err(DroneError::DuplicateExecution(request.tag));
        }
        let needed = request.num_processes.max(1);
        let chosen = self
            .candidates(&request.username, request.allowed_drones.as_ref())
            .filter(|(drone, active)| active + needed <= drone.max_processes)
            .min_by(|(a, a_active), (b, b_active)| {
                compare_load(*a_active, a.max_processes, *b_active, b.max_processes)
            })
            .map(|(drone, _)| drone.hostname.clone());

        let Some(hostname) = chosen else {
            warn!(
                tag = %request.tag,
                user = %request.username,
                processes = needed,
                "no drone has capacity, deferring"
            );
            return Ok(None);
        };

        let working_dir = self.settings.results_dir.join(&request.tag);
        let execute = ExecuteRequest {
            log_file: working_dir.join("execute.log"),
            working_dir,
            tag: request.tag.clone(),
            command: request.command,
            dark_mark: self.dark_mark.clone(),
        };
        if let Some(drone) = self.drones.get_mut(&hostname) {
            drone.queue.push(DroneCall::Execute(execute));
        }
        self.executions.insert(
            request.tag.clone(),
            Execution {
                tag: request.tag.clone(),
                drone: hostname.clone(),
                pid: None,
                num_processes: needed,
                state: ExecutionState::Pending,
            },
        );
        debug!(tag = %request.tag, drone = %hostname, processes = needed, "execution queued");
        Ok(Some(hostname))
    }

    /// Re-attach an execution that was already running, e.g. after a
    /// scheduler restart. Without a pid it is matched by tag on the next
    /// refresh.
    pub fn register_execution(
        &mut self,
        tag: &str,
        drone: &str,
        pid: Option<u32>,
        num_processes: u32,
    ) -> DroneResult<()> {
        if !self.drones.contains_key(drone) {
            return Err(DroneError::UnknownDrone(drone.to_string()));
        }
        if self.executions.contains_key(tag) {
            return Err(DroneError::DuplicateExecution(tag.to_string()));
        }
        self.executions.insert(
            tag.to_string(),
            Execution {
                tag: tag.to_string(),
                drone: drone.to_string(),
                pid,
                num_processes: num_processes.max(1),
                state: ExecutionState::Started,
            },
        );
        info!(%tag, %drone, ?pid, "execution re-attached");
        Ok(())
    }

    /// Queue SIGCONT+SIGTERM for a process on `drone`.
    pub fn kill_process(&mut self, drone: &str, pid: u32) -> DroneResult<()> {
        let Some(target) = self.drones.get_mut(drone) else {
            return Err(DroneError::UnknownDrone(drone.to_string()));
        };
        target.queue.push(DroneCall::Kill(pid));
        Ok(())
    }

    /// Owned processes that were reparented to init and that no tracked
    /// execution accounts for.
    pub fn orphaned_processes(&self) -> Vec<(String, ProcessRecord)> {
        let tracked: BTreeSet<(&str, u32)> = self
            .executions
            .values()
            .filter_map(|e| e.pid.map(|pid| (e.drone.as_str(), pid)))
            .collect();
        self.processes
            .iter()
            .flat_map(|(drone, records)| records.iter().map(move |r| (drone, r)))
            .filter(|(drone, r)| r.is_orphan() && !tracked.contains(&(drone.as_str(), r.pid)))
            .map(|(drone, r)| (drone.clone(), r.clone()))
            .collect()
    }

    pub fn drone_summaries(&self) -> Vec<DroneSummary> {
        self.drones
            .values()
            .map(|d| DroneSummary {
                hostname: d.hostname.clone(),
                active_processes: self.active_processes(&d.hostname),
                max_processes: d.max_processes,
                enabled: d.enabled,
                reachable: d.reachable,
                reported_processes: d.reported_processes,
            })
            .collect()
    }

    /// Read every drone's process table and settle completed executions.
    ///
    /// A drone that times out is unreachable until the next refresh. A
    /// drone whose table cannot be read reports zero processes and
    /// completes nothing.
    pub async fn refresh(&mut self, deadline: Instant) -> RefreshReport {
        let mut calls = JoinSet::new();
        let mut outstanding = BTreeSet::new();
        for (hostname, drone) in &self.drones {
            let transport = drone.transport.clone();
            let hostname = hostname.clone();
            let per_call = self.settings.drone_timeout;
            outstanding.insert(hostname.clone());
            calls.spawn(async move {
                let result = timeout(per_call, transport.process_table()).await;
                (hostname, result)
            });
        }

        let mut report = RefreshReport::default();
        let mut tables: BTreeMap<String, Vec<ProcessRecord>> = BTreeMap::new();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                joined = calls.join_next() => {
                    let Some(joined) = joined else { break };
                    let (hostname, result) = match joined {
                        Ok(done) => done,
                        Err(err) => {
                            error!(error = %err, "process table task failed");
                            continue;
                        }
                    };
                    outstanding.remove(&hostname);
                    match result {
                        Ok(Ok(records)) => {
                            tables.insert(hostname, records);
                        }
                        Ok(Err(err)) => {
                            warn!(drone = %hostname, error = %err, "process table read failed, assuming no processes");
                            self.record_processes(&hostname, Vec::new(), true);
                        }
                        Err(_) => {
                            warn!(drone = %hostname, "process table read timed out");
                            report.unreachable.push(hostname);
                        }
                    }
                }
                _ = &mut sleep => {
                    calls.abort_all();
                    warn!(pending = outstanding.len(), "refresh deadline reached");
                    break;
                }
            }
        }
        // Aborted and panicked calls.
        report.unreachable.extend(outstanding);

        for hostname in &report.unreachable {
            if let Some(drone) = self.drones.get_mut(hostname) {
                drone.reachable = false;
            }
        }
        for (hostname, records) in tables {
            let owned = select_owned(
                records,
                &self.settings.command_name,
                self.settings.check_dark_mark,
            );
            self.settle(&hostname, &owned, &mut report);
            self.record_processes(&hostname, owned, true);
        }
        for done in &report.completed {
            self.executions.remove(&done.tag);
            info!(tag = %done.tag, drone = %done.drone, pid = ?done.pid, "execution complete");
        }
        for tag in &report.lost {
            self.executions.remove(tag);
            warn!(%tag, "unconfirmed start has no process, releasing");
        }
        report.unreachable.sort();
        report
    }

    fn record_processes(&mut self, hostname: &str, owned: Vec<ProcessRecord>, reachable: bool) {
        if let Some(drone) = self.drones.get_mut(hostname) {
            drone.reachable = reachable;
            drone.reported_processes = owned.len();
        }
        self.processes.insert(hostname.to_string(), owned);
    }

    /// Match the executions on `hostname` against its owned processes.
    ///
    /// Started executions whose root process is gone complete. Unconfirmed
    /// ones are adopted when a process names their tag and lost otherwise.
    fn settle(&mut self, hostname: &str, owned: &[ProcessRecord], report: &mut RefreshReport) {
        for execution in self.executions.values_mut() {
            if execution.drone != hostname || execution.state == ExecutionState::Pending {
                continue;
            }
            let alive = match execution.pid {
                Some(pid) => owned.iter().any(|p| p.pid == pid),
                None => match owned.iter().find(|p| args_mention_tag(&p.args, &execution.tag)) {
                    Some(process) => {
                        debug!(tag = %execution.tag, pid = process.pid, "matched execution by tag");
                        execution.pid = Some(process.pid);
                        true
                    }
                    None => false,
                },
            };
            match (execution.state, alive) {
                (ExecutionState::Unconfirmed, true) => {
                    execution.state = ExecutionState::Started;
                    if let Some(pid) = execution.pid {
                        report.adopted.push(StartedExecution {
                            tag: execution.tag.clone(),
                            drone: execution.drone.clone(),
                            pid,
                        });
                    }
                }
                (ExecutionState::Unconfirmed, false) => report.lost.push(execution.tag.clone()),
                (_, false) => report.completed.push(CompletedExecution {
                    tag: execution.tag.clone(),
                    drone: execution.drone.clone(),
                    pid: execution.pid,
                }),
                (_, true) => {}
            }
        }
    }

    /// Fan queued calls out to the drones and wait for them, at most until
    /// `deadline`.
    pub async fn execute_actions(&mut self, deadline: Instant) -> ExecuteReport {
        let mut calls = JoinSet::new();
        let mut outstanding: BTreeMap<usize, (String, Option<String>)> = BTreeMap::new();
        for (hostname, drone) in self.drones.iter_mut() {
            for call in drone.queue.drain(..) {
                let index = outstanding.len();
                let tag = match &call {
                    DroneCall::Execute(request) => Some(request.tag.clone()),
                    DroneCall::Kill(_) => None,
                };
                outstanding.insert(index, (hostname.clone(), tag));
                calls.spawn(run_call(
                    index,
                    drone.transport.clone(),
                    call,
                    self.settings.drone_timeout,
                ));
            }
        }
        if outstanding.is_empty() {
            return ExecuteReport::default();
        }
        debug!(calls = outstanding.len(), "executing drone actions");

        let mut report = ExecuteReport::default();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                joined = calls.join_next() => {
                    let Some(joined) = joined else { break };
                    let (index, result) = match joined {
                        Ok(done) => done,
                        Err(err) => {
                            error!(error = %err, "drone call task failed");
                            continue;
                        }
                    };
                    let Some((hostname, tag)) = outstanding.remove(&index) else { continue };
                    self.finish_call(&mut report, hostname, tag, result);
                }
                _ = &mut sleep => {
                    calls.abort_all();
                    warn!(pending = outstanding.len(), "drone action deadline reached");
                    break;
                }
            }
        }

        // Cut off mid-call, so treated like a per-call timeout.
        for (hostname, tag) in std::mem::take(&mut outstanding).into_values() {
            self.finish_call(&mut report, hostname, tag, CallResult::TimedOut);
        }
        report
    }

    fn finish_call(
        &mut self,
        report: &mut ExecuteReport,
        hostname: String,
        tag: Option<String>,
        result: CallResult,
    ) {
        match (result, tag) {
            (CallResult::Started(pid), Some(tag)) => {
                if let Some(execution) = self.executions.get_mut(&tag) {
                    execution.pid = Some(pid);
                    execution.state = ExecutionState::Started;
                }
                report.started.push(StartedExecution {
                    tag,
                    drone: hostname,
                    pid,
                });
            }
            (CallResult::Killed, _) | (CallResult::Started(_), None) => {}
            (CallResult::TimedOut, Some(tag)) => {
                if let Some(drone) = self.drones.get_mut(&hostname) {
                    drone.reachable = false;
                }
                warn!(drone = %hostname, %tag, "start call timed out, holding capacity until the next refresh");
                if let Some(execution) = self.executions.get_mut(&tag) {
                    execution.state = ExecutionState::Unconfirmed;
                }
                report.unconfirmed.push(tag);
            }
            (failure, tag) => {
                let source = match failure {
                    CallResult::TimedOut => {
                        if let Some(drone) = self.drones.get_mut(&hostname) {
                            drone.reachable = false;
                        }
                        anyhow::anyhow!("call timed out")
                    }
                    CallResult::Failed(err) => err,
                    CallResult::Started(_) | CallResult::Killed => return,
                };
                error!(drone = %hostname, tag = ?tag, error = %source, "drone call failed");
                if let Some(tag) = &tag {
                    self.executions.remove(tag);
                }
                report.failed.push(FailedCall {
                    tag,
                    error: DroneError::Transport {
                        drone: hostname,
                        source,
                    },
                });
            }
        }
    }
}

enum CallResult {
    Started(u32),
    Killed,
    TimedOut,
    Failed(anyhow::Error),
}

async fn run_call(
    index: usize,
    transport: Arc<dyn DroneTransport>,
    call: DroneCall,
    per_call: Duration,
) -> (usize, CallResult) {
    let result = match call {
        DroneCall::Execute(request) => match timeout(per_call, transport.execute(request)).await {
            Ok(Ok(pid)) => CallResult::Started(pid),
            Ok(Err(err)) => CallResult::Failed(err),
            Err(_) => CallResult::TimedOut,
        },
        DroneCall::Kill(pid) => match timeout(per_call, transport.kill(pid)).await {
            Ok(Ok(())) => CallResult::Killed,
            Ok(Err(err)) => CallResult::Failed(err),
            Err(_) => CallResult::TimedOut,
        },
    };
    (index, result)
}

/// Whether a command line names the results directory of `tag`.
fn args_mention_tag(args: &str, tag: &str) -> bool {
    args.split_whitespace()
        .any(|arg| arg == tag || arg.trim_end_matches('/').ends_with(&format!("/{tag}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use dronegrid_config::DroneConfig;

    use super::*;
    use crate::transport::TransportFuture;

    /// Scripted in-memory drone.
    #[derive(Default)]
    struct FakeDrone {
        table: Mutex<Vec<ProcessRecord>>,
        next_pid: Mutex<u32>,
        started: Mutex<Vec<ExecuteRequest>>,
        killed: Mutex<Vec<u32>>,
        hang: bool,
        /// Execute never answers; `start_first` decides whether the
        /// process was spawned before the call stalled.
        stall_execute: bool,
        start_first: bool,
        broken_table: bool,
    }

    impl FakeDrone {
        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }

        fn stalling(start_first: bool) -> Self {
            Self {
                stall_execute: true,
                start_first,
                ..Self::default()
            }
        }

        fn broken() -> Self {
            Self {
                broken_table: true,
                ..Self::default()
            }
        }

        fn set_table(&self, records: Vec<ProcessRecord>) {
            *self.table.lock().unwrap() = records;
        }
    }

    impl DroneTransport for FakeDrone {
        fn process_table(&self) -> TransportFuture<'_, Vec<ProcessRecord>> {
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                if self.broken_table {
                    anyhow::bail!("ps: permission denied");
                }
                Ok(self.table.lock().unwrap().clone())
            })
        }

        fn execute(&self, request: ExecuteRequest) -> TransportFuture<'_, u32> {
            Box::pin(async move {
                if self.hang || (self.stall_execute && !self.start_first) {
                    std::future::pending::<()>().await;
                }
                let pid = {
                    let mut next = self.next_pid.lock().unwrap();
                    *next += 1;
                    1000 + *next
                };
                self.table.lock().unwrap().push(autoserv(pid, &request.tag));
                self.started.lock().unwrap().push(request);
                if self.stall_execute {
                    std::future::pending::<()>().await;
                }
                Ok(pid)
            })
        }

        fn kill(&self, pid: u32) -> TransportFuture<'_, ()> {
            Box::pin(async move {
                self.killed.lock().unwrap().push(pid);
                self.table.lock().unwrap().retain(|p| p.pid != pid);
                Ok(())
            })
        }
    }

    fn autoserv(pid: u32, tag: &str) -> ProcessRecord {
        ProcessRecord {
            pid,
            pgid: pid,
            ppid: 1,
            command: "autoserv".into(),
            args: format!("autoserv -p -r /results/{tag}"),
            dark_mark: true,
        }
    }

    fn config(drones: &[(&str, Option<u32>)]) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.scheduler.max_processes_per_drone = 10;
        config.scheduler.drone_timeout_secs = 1;
        config.scheduler.results_dir = PathBuf::from("/results");
        for (hostname, max) in drones {
            config.drones.insert(
                hostname.to_string(),
                DroneConfig {
                    max_processes: *max,
                    ..DroneConfig::default()
                },
            );
        }
        config
    }

    fn manager_with(
        config: &SchedulerConfig,
        fakes: Vec<(&str, Arc<FakeDrone>)>,
    ) -> DroneManager {
        let fakes: BTreeMap<String, Arc<FakeDrone>> = fakes
            .into_iter()
            .map(|(h, f)| (h.to_string(), f))
            .collect();
        let factory: TransportFactory = Box::new(move |hostname: &str, _: &DroneConfig| {
            let fake = fakes.get(hostname).cloned().unwrap_or_default();
            fake as Arc<dyn DroneTransport>
        });
        DroneManager::new(config, factory).unwrap()
    }

    fn request(tag: &str, processes: u32) -> DispatchRequest {
        DispatchRequest {
            tag: tag.to_string(),
            command: vec!["autoserv".into(), "-r".into(), format!("/results/{tag}")],
            username: "alice".into(),
            allowed_drones: None,
            num_processes: processes,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn no_drones_is_an_error() {
        let factory: TransportFactory =
            Box::new(|_: &str, _: &DroneConfig| Arc::new(FakeDrone::default()) as Arc<dyn DroneTransport>);
        assert!(matches!(
            DroneManager::new(&SchedulerConfig::default(), factory),
            Err(DroneError::NoDrones)
        ));
    }

    #[test]
    fn full_drone_defers_dispatch() {
        let config = config(&[("d1", Some(5))]);
        let mut manager = manager_with(&config, vec![]);
        manager.register_execution("1-busy", "d1", Some(40), 5).unwrap();
        assert_eq!(manager.active_processes("d1"), 5);

        let placed = manager.execute_command(request("2-new", 1)).unwrap();
        assert_eq!(placed, None);
        assert!(manager.execution("2-new").is_none());
        assert_eq!(manager.active_processes("d1"), 5);
    }

    #[test]
    fn dispatch_prefers_least_loaded_then_largest() {
        let config = config(&[("small", Some(4)), ("large", Some(8))]);
        let mut manager = manager_with(&config, vec![]);

        assert_eq!(
            manager.execute_command(request("1-a", 1)).unwrap().as_deref(),
            Some("large")
        );
        // large at 1/8, small at 0/4
        assert_eq!(
            manager.execute_command(request("2-b", 1)).unwrap().as_deref(),
            Some("small")
        );
        // large 1/8 beats small 1/4
        assert_eq!(
            manager.execute_command(request("3-c", 1)).unwrap().as_deref(),
            Some("large")
        );
        assert_eq!(manager.total_running_processes(), 3);
    }

    #[test]
    fn capacity_never_exceeded() {
        let config = config(&[("d1", Some(3)), ("d2", Some(2))]);
        let mut manager = manager_with(&config, vec![]);
        let mut placed = 0;
        for i in 0..10 {
            if manager
                .execute_command(request(&format!("{i}-t"), 1))
                .unwrap()
                .is_some()
            {
                placed += 1;
            }
            for summary in manager.drone_summaries() {
                assert!(summary.active_processes <= summary.max_processes);
            }
        }
        assert_eq!(placed, 5);
    }

    #[test]
    fn multi_process_requests_need_room_for_all() {
        let config = config(&[("d1", Some(4))]);
        let mut manager = manager_with(&config, vec![]);
        assert!(manager.execute_command(request("1-a", 3)).unwrap().is_some());
        assert_eq!(manager.max_runnable_processes("alice", None), 1);
        assert!(manager.execute_command(request("2-b", 2)).unwrap().is_none());
        assert!(manager.execute_command(request("3-c", 1)).unwrap().is_some());
    }

    #[test]
    fn disabled_and_restricted_drones_are_skipped() {
        let mut config = config(&[("d1", None), ("d2", None), ("d3", None)]);
        config.drones.get_mut("d1").unwrap().disabled = true;
        config.drones.get_mut("d2").unwrap().users = Some(["bob".to_string()].into());
        let mut manager = manager_with(&config, vec![]);

        assert_eq!(
            manager.execute_command(request("1-a", 1)).unwrap().as_deref(),
            Some("d3")
        );
        let mut only_d2 = request("2-b", 1);
        only_d2.allowed_drones = Some(["d2".to_string()].into());
        assert_eq!(manager.execute_command(only_d2).unwrap(), None);
        assert_eq!(manager.max_runnable_processes("bob", None), 10);
    }

    #[test]
    fn duplicate_tags_rejected() {
        let config = config(&[("d1", None)]);
        let mut manager = manager_with(&config, vec![]);
        manager.execute_command(request("1-a", 1)).unwrap();
        assert!(matches!(
            manager.execute_command(request("1-a", 1)),
            Err(DroneError::DuplicateExecution(_))
        ));
        assert!(matches!(
            manager.register_execution("9-x", "nope", None, 1),
            Err(DroneError::UnknownDrone(_))
        ));
    }

    #[tokio::test]
    async fn execute_then_complete() {
        let fake = Arc::new(FakeDrone::default());
        let config = config(&[("d1", None)]);
        let mut manager = manager_with(&config, vec![("d1", fake.clone())]);

        manager.execute_command(request("5-job", 1)).unwrap();
        let report = manager.execute_actions(soon()).await;
        assert!(report.failed.is_empty());
        assert_eq!(report.started.len(), 1);
        let pid = report.started[0].pid;

        let started = fake.started.lock().unwrap().clone();
        assert_eq!(started[0].working_dir, PathBuf::from("/results/5-job"));
        assert_eq!(started[0].dark_mark, manager.dark_mark());

        let report = manager.refresh(soon()).await;
        assert!(report.completed.is_empty());
        assert_eq!(manager.execution("5-job").unwrap().pid, Some(pid));

        fake.set_table(Vec::new());
        let report = manager.refresh(soon()).await;
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].tag, "5-job");
        assert_eq!(manager.active_processes("d1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_drone_is_skipped_for_one_tick() {
        let slow = Arc::new(FakeDrone::hanging());
        let fast = Arc::new(FakeDrone::default());
        let config = config(&[("fast", Some(2)), ("slow", Some(8))]);
        let mut manager = manager_with(&config, vec![("slow", slow), ("fast", fast)]);

        let report = manager.refresh(soon()).await;
        assert_eq!(report.unreachable, vec!["slow".to_string()]);
        assert!(!manager.drone("slow").unwrap().reachable());

        assert_eq!(
            manager.execute_command(request("1-a", 1)).unwrap().as_deref(),
            Some("fast")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_start_holds_capacity_until_refresh() {
        let slow = Arc::new(FakeDrone::stalling(false));
        let config = config(&[("slow", Some(1))]);
        let mut manager = manager_with(&config, vec![("slow", slow)]);

        manager.execute_command(request("1-a", 1)).unwrap();
        let report = manager.execute_actions(soon()).await;
        assert!(report.started.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.unconfirmed, vec!["1-a".to_string()]);
        assert_eq!(
            manager.execution("1-a").unwrap().state,
            ExecutionState::Unconfirmed
        );
        assert_eq!(manager.active_processes("slow"), 1);
        assert_eq!(manager.execute_command(request("2-b", 1)).unwrap(), None);

        let report = manager.refresh(soon()).await;
        assert_eq!(report.lost, vec!["1-a".to_string()]);
        assert!(report.completed.is_empty());
        assert!(manager.execution("1-a").is_none());
        assert_eq!(manager.active_processes("slow"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_start_adopted_when_process_runs() {
        let slow = Arc::new(FakeDrone::stalling(true));
        let config = config(&[("slow", Some(1))]);
        let mut manager = manager_with(&config, vec![("slow", slow.clone())]);

        manager.execute_command(request("1-a", 1)).unwrap();
        let report = manager.execute_actions(soon()).await;
        assert_eq!(report.unconfirmed, vec!["1-a".to_string()]);

        let report = manager.refresh(soon()).await;
        assert!(report.lost.is_empty());
        assert!(report.completed.is_empty());
        assert_eq!(report.adopted.len(), 1);
        assert_eq!(report.adopted[0].tag, "1-a");
        assert_eq!(report.adopted[0].pid, 1001);
        let execution = manager.execution("1-a").unwrap();
        assert_eq!(execution.state, ExecutionState::Started);
        assert_eq!(execution.pid, Some(1001));
        assert_eq!(slow.started.lock().unwrap().len(), 1);

        slow.set_table(Vec::new());
        let report = manager.refresh(soon()).await;
        assert_eq!(report.completed.len(), 1);
        assert_eq!(manager.active_processes("slow"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_drone_keeps_unconfirmed_start() {
        let slow = Arc::new(FakeDrone::hanging());
        let config = config(&[("slow", Some(1))]);
        let mut manager = manager_with(&config, vec![("slow", slow)]);

        manager.execute_command(request("1-a", 1)).unwrap();
        manager.execute_actions(soon()).await;
        let report = manager.refresh(soon()).await;
        assert_eq!(report.unreachable, vec!["slow".to_string()]);
        assert!(report.lost.is_empty());
        assert_eq!(manager.active_processes("slow"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_deadline_bounds_execute() {
        let slow = Arc::new(FakeDrone::hanging());
        let mut config = config(&[("slow", None)]);
        config.scheduler.drone_timeout_secs = 60;
        let mut manager = manager_with(&config, vec![("slow", slow)]);

        manager.execute_command(request("1-a", 1)).unwrap();
        let start = Instant::now();
        let report = manager.execute_actions(start + Duration::from_secs(2)).await;
        assert!(report.failed.is_empty());
        assert_eq!(report.unconfirmed, vec!["1-a".to_string()]);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(
            manager.execution("1-a").unwrap().state,
            ExecutionState::Unconfirmed
        );
    }

    #[tokio::test]
    async fn unreadable_table_completes_nothing() {
        let broken = Arc::new(FakeDrone::broken());
        let config = config(&[("d1", Some(2))]);
        let mut manager = manager_with(&config, vec![("d1", broken)]);
        manager.register_execution("1-a", "d1", Some(77), 1).unwrap();

        let report = manager.refresh(soon()).await;
        assert!(report.completed.is_empty());
        assert!(report.unreachable.is_empty());
        let summary = &manager.drone_summaries()[0];
        assert_eq!(summary.reported_processes, 0);
        assert_eq!(summary.active_processes, 1);
        assert!(summary.reachable);
    }

    #[tokio::test]
    async fn reattached_execution_matched_by_tag() {
        let fake = Arc::new(FakeDrone::default());
        fake.set_table(vec![autoserv(300, "12-nightly"), autoserv(301, "13-stray")]);
        let config = config(&[("d1", None)]);
        let mut manager = manager_with(&config, vec![("d1", fake)]);
        manager.register_execution("12-nightly", "d1", None, 1).unwrap();
        manager.register_execution("2-nightly", "d1", None, 1).unwrap();

        let report = manager.refresh(soon()).await;
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].tag, "2-nightly");
        assert_eq!(manager.execution("12-nightly").unwrap().pid, Some(300));

        let orphans = manager.orphaned_processes();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, "d1");
        assert_eq!(orphans[0].1.pid, 301);
    }

    #[tokio::test]
    async fn unmarked_processes_ignored_when_checking() {
        let fake = Arc::new(FakeDrone::default());
        let mut stranger = autoserv(500, "99-other");
        stranger.dark_mark = false;
        fake.set_table(vec![stranger]);
        let mut config = config(&[("d1", None)]);
        config.scheduler.check_processes_for_dark_mark = true;
        let mut manager = manager_with(&config, vec![("d1", fake)]);

        manager.refresh(soon()).await;
        assert!(manager.orphaned_processes().is_empty());
        assert_eq!(manager.drone_summaries()[0].reported_processes, 0);
    }

    #[tokio::test]
    async fn kill_reaches_drone() {
        let fake = Arc::new(FakeDrone::default());
        let config = config(&[("d1", None)]);
        let mut manager = manager_with(&config, vec![("d1", fake.clone())]);
        manager.kill_process("d1", 42).unwrap();
        let report = manager.execute_actions(soon()).await;
        assert!(report.failed.is_empty());
        assert_eq!(*fake.killed.lock().unwrap(), vec![42]);
    }

    #[test]
    fn config_refresh_adds_updates_and_removes() {
        let mut manager = manager_with(&config(&[("d1", None), ("d2", None)]), vec![]);
        manager.register_execution("1-a", "d2", Some(5), 1).unwrap();

        let mut updated = config(&[("d1", Some(3)), ("d3", None)]);
        updated.drones.get_mut("d1").unwrap().disabled = true;
        manager.refresh_drone_configs(&updated);

        let d1 = manager.drone("d1").unwrap();
        assert_eq!(d1.max_processes(), 3);
        assert!(!d1.enabled());
        // busy drones linger disabled until their work completes
        assert!(!manager.drone("d2").unwrap().enabled());
        assert!(manager.drone("d3").unwrap().enabled());

        manager.refresh_drone_configs(&config(&[("d3", None)]));
        assert!(manager.drone("d1").is_none());
        assert!(manager.drone("d2").is_some());
    }

    #[test]
    fn tag_matching_requires_path_boundary() {
        assert!(args_mention_tag("autoserv -r /results/12-a", "12-a"));
        assert!(args_mention_tag("autoserv -r /results/12-a/", "12-a"));
        assert!(!args_mention_tag("autoserv -r /results/112-a", "12-a"));
    }
}
