//! Process records, the dark mark and process-table inspection.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

/// Environment variable stamped on every process the scheduler spawns.
/// Its value is the pid of the scheduler that started the process.
pub const DARK_MARK_ENV: &str = "DRONEGRID_SCHEDULER_DARK_MARK";

/// One row of a drone's process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub pgid: u32,
    pub ppid: u32,
    /// Executable name as reported by the kernel (`comm`).
    pub command: String,
    /// Full command line.
    pub args: String,
    /// Whether the process environment carries [`DARK_MARK_ENV`].
    pub dark_mark: bool,
}

impl ProcessRecord {
    /// Root processes lead their own process group.
    pub fn is_root(&self) -> bool {
        self.pgid == self.pid
    }

    /// Reparented to init after its parent died.
    pub fn is_orphan(&self) -> bool {
        self.ppid == 1
    }
}

/// Reads the raw process table of the machine it runs on.
pub trait ProcessInspector: Send + Sync {
    fn process_table(&self) -> anyhow::Result<Vec<ProcessRecord>>;
}

/// Keep root processes named `command_name`.
///
/// With `check_dark_mark`, unmarked processes are dropped with a warning so
/// a same-named process started by someone else is never mistaken for ours.
pub fn select_owned(
    records: Vec<ProcessRecord>,
    command_name: &str,
    check_dark_mark: bool,
) -> Vec<ProcessRecord> {
    records
        .into_iter()
        .filter(|p| p.command == command_name && p.is_root())
        .filter(|p| {
            if check_dark_mark && !p.dark_mark {
                warn!(pid = p.pid, command = %p.command, "process has no dark mark, ignoring");
                return false;
            }
            true
        })
        .collect()
}

/// Linux `/proc` reader.
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsInspector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_process(&self, pid: u32) -> Option<ProcessRecord> {
        let dir = self.root.join(pid.to_string());
        let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
        let (command, ppid, pgid) = parse_stat(&stat)?;
        let args = std::fs::read(dir.join("cmdline"))
            .map(|raw| split_nul(&raw).join(" "))
            .unwrap_or_default();
        Some(ProcessRecord {
            pid,
            pgid,
            ppid,
            command,
            args,
            dark_mark: has_dark_mark(&dir),
        })
    }
}

impl ProcessInspector for ProcfsInspector {
    fn process_table(&self) -> anyhow::Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes may exit between listing and reading.
            if let Some(record) = self.read_process(pid) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.pid);
        debug!(root = %self.root.display(), count = records.len(), "process table read");
        Ok(records)
    }
}

/// Parse `comm`, `ppid` and `pgrp` out of `/proc/<pid>/stat`.
///
/// `comm` is parenthesised and may itself contain spaces or parentheses,
/// so the fields are located relative to the last `)`.
fn parse_stat(stat: &str) -> Option<(String, u32, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let command = stat.get(open + 1..close)?.to_string();
    let mut fields = stat.get(close + 1..)?.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some((command, ppid, pgid))
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn has_dark_mark(dir: &Path) -> bool {
    let Ok(raw) = std::fs::read(dir.join("environ")) else {
        return false;
    };
    let prefix = format!("{DARK_MARK_ENV}=");
    split_nul(&raw).iter().any(|var| var.starts_with(&prefix))
}

/// Parse `ps x -o pid=,pgid=,ppid=,comm=,args=` output.
pub fn parse_ps_output(output: &str, marked_pids: &[u32]) -> Vec<ProcessRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid: u32 = parts.next()?.parse().ok()?;
            let pgid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            let command = parts.next()?.to_string();
            let args = parts.collect::<Vec<_>>().join(" ");
            Some(ProcessRecord {
                pid,
                pgid,
                ppid,
                command,
                args,
                dark_mark: marked_pids.contains(&pid),
            })
        })
        .collect()
}
