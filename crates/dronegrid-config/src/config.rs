//! dronegrid.toml configuration model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Worker machines keyed by hostname.
    #[serde(default)]
    pub drones: BTreeMap<String, DroneConfig>,
}

/// Named scalar options of the `[scheduler]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enable_scheduler: bool,
    /// Sleep between ticks.
    pub tick_pause_secs: u64,
    /// Upper bound on the drone fan-out phase of one tick.
    pub tick_timeout_secs: u64,
    /// Per-drone call timeout.
    pub drone_timeout_secs: u64,
    pub clean_interval_minutes: u64,
    /// Minimum time between reverify passes; 0 disables reverification.
    pub reverify_period_minutes: u64,
    /// Verify tasks created per reverify pass; 0 means unlimited.
    pub reverify_max_hosts_at_once: u32,
    /// Synchronous jobs still waiting to start this long after creation are
    /// aborted; 0 disables the check.
    pub synch_job_start_timeout_minutes: u64,
    pub check_processes_for_dark_mark: bool,
    pub max_processes_per_drone: u32,
    pub max_processes_started_per_cycle: u32,
    /// Command name whose processes count against drone capacity.
    pub process_command_name: String,
    /// Status server port; 0 disables the server.
    pub status_server_port: u16,
    pub results_dir: PathBuf,
    /// Completed special tasks older than this are purged by the daily upkeep.
    pub special_task_retention_days: u64,
    pub notify_email_to: Vec<String>,
    pub notify_email_from: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enable_scheduler: true,
            tick_pause_secs: 5,
            tick_timeout_secs: 120,
            drone_timeout_secs: 30,
            clean_interval_minutes: 60,
            reverify_period_minutes: 30,
            reverify_max_hosts_at_once: 0,
            synch_job_start_timeout_minutes: 240,
            check_processes_for_dark_mark: false,
            max_processes_per_drone: 50,
            max_processes_started_per_cycle: 20,
            process_command_name: "autoserv".to_string(),
            status_server_port: 13467,
            results_dir: PathBuf::from("/var/lib/dronegrid/results"),
            special_task_retention_days: 30,
            notify_email_to: Vec::new(),
            notify_email_from: "dronegrid@localhost".to_string(),
        }
    }
}

/// How the scheduler reaches a drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Local,
    Ssh,
}

/// One `[drones.<hostname>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DroneConfig {
    /// Overrides `scheduler.max_processes_per_drone`.
    pub max_processes: Option<u32>,
    pub disabled: bool,
    /// Job owners allowed on this drone; absent means everyone.
    pub users: Option<BTreeSet<String>>,
    pub transport: TransportKind,
    /// Remote login for ssh transports.
    pub ssh_user: Option<String>,
}

impl SchedulerConfig {
    /// Read and validate a configuration file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.scheduler;
        if s.tick_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tick_timeout_secs must be greater than zero".into(),
            ));
        }
        if s.drone_timeout_secs == 0 || s.drone_timeout_secs > s.tick_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "drone_timeout_secs must be between 1 and tick_timeout_secs ({})",
                s.tick_timeout_secs
            )));
        }
        if s.max_processes_per_drone == 0 {
            return Err(ConfigError::Invalid(
                "max_processes_per_drone must be greater than zero".into(),
            ));
        }
        if s.process_command_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "process_command_name must not be empty".into(),
            ));
        }
        for (hostname, drone) in &self.drones {
            if hostname.trim().is_empty() {
                return Err(ConfigError::Invalid("drone hostname must not be empty".into()));
            }
            if drone.max_processes == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "drone {hostname}: max_processes must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Effective capacity of a drone.
    pub fn drone_max_processes(&self, hostname: &str) -> u32 {
        self.drones
            .get(hostname)
            .and_then(|d| d.max_processes)
            .unwrap_or(self.scheduler.max_processes_per_drone)
    }

    pub fn tick_pause(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_pause_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_timeout_secs)
    }

    pub fn drone_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.drone_timeout_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.clean_interval_minutes * 60)
    }

    /// `None` when reverification is disabled.
    pub fn reverify_period(&self) -> Option<Duration> {
        match self.scheduler.reverify_period_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        }
    }

    pub fn synch_job_start_timeout(&self) -> Option<Duration> {
        match self.scheduler.synch_job_start_timeout_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        }
    }

    /// Name/value pairs shown on the status page, scheduler options first.
    pub fn describe(&self) -> Vec<(String, String)> {
        let s = &self.scheduler;
        let mut pairs = vec![
            ("enable_scheduler".to_string(), s.enable_scheduler.to_string()),
            ("tick_pause_secs".to_string(), s.tick_pause_secs.to_string()),
            ("tick_timeout_secs".to_string(), s.tick_timeout_secs.to_string()),
            ("drone_timeout_secs".to_string(), s.drone_timeout_secs.to_string()),
            (
                "clean_interval_minutes".to_string(),
                s.clean_interval_minutes.to_string(),
            ),
            (
                "reverify_period_minutes".to_string(),
                s.reverify_period_minutes.to_string(),
            ),
            (
                "reverify_max_hosts_at_once".to_string(),
                s.reverify_max_hosts_at_once.to_string(),
            ),
            (
                "synch_job_start_timeout_minutes".to_string(),
                s.synch_job_start_timeout_minutes.to_string(),
            ),
            (
                "check_processes_for_dark_mark".to_string(),
                s.check_processes_for_dark_mark.to_string(),
            ),
            (
                "max_processes_per_drone".to_string(),
                s.max_processes_per_drone.to_string(),
            ),
            (
                "max_processes_started_per_cycle".to_string(),
                s.max_processes_started_per_cycle.to_string(),
            ),
            ("process_command_name".to_string(), s.process_command_name.clone()),
            ("status_server_port".to_string(), s.status_server_port.to_string()),
            ("results_dir".to_string(), s.results_dir.display().to_string()),
            (
                "special_task_retention_days".to_string(),
                s.special_task_retention_days.to_string(),
            ),
            ("notify_email_to".to_string(), s.notify_email_to.join(", ")),
        ];
        for hostname in self.drones.keys() {
            pairs.push((
                format!("drones.{hostname}.max_processes"),
                self.drone_max_processes(hostname).to_string(),
            ));
        }
        pairs
    }
}
