//! Remote drone reached over `ssh`.

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::{debug, info};

use crate::process::{DARK_MARK_ENV, ProcessRecord, parse_ps_output};
use crate::transport::{DroneTransport, ExecuteRequest, TransportFuture};

const SECTION_BREAK: &str = "--dronegrid-marked--";

pub struct SshDrone {
    hostname: String,
    user: Option<String>,
}

impl SshDrone {
    pub fn new(hostname: impl Into<String>, user: Option<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user,
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }

    async fn run(&self, script: &str) -> anyhow::Result<String> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
            .arg(self.destination())
            .arg(script)
            .kill_on_drop(true);
        debug!(drone = %self.hostname, %script, "running remote command");
        let output = cmd.output().await.context("spawning ssh")?;
        if !output.status.success() {
            bail!(
                "remote command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Single-quote `arg` for a POSIX shell.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Script listing the process table, then the pids whose environment
/// carries the dark mark.
fn process_table_script() -> String {
    format!(
        "ps x -o pid=,pgid=,ppid=,comm=,args=; echo {SECTION_BREAK}; \
         grep -l -a {DARK_MARK_ENV}= /proc/[0-9]*/environ 2>/dev/null; true"
    )
}

fn parse_process_table(output: &str) -> Vec<ProcessRecord> {
    let (ps, marked) = output.split_once(SECTION_BREAK).unwrap_or((output, ""));
    let marked_pids: Vec<u32> = marked
        .lines()
        .filter_map(|path| path.trim().strip_prefix("/proc/"))
        .filter_map(|rest| rest.split('/').next())
        .filter_map(|pid| pid.parse().ok())
        .collect();
    parse_ps_output(ps, &marked_pids)
}

/// Script that starts the command detached in its own session and prints
/// its pid.
fn execute_script(request: &ExecuteRequest) -> String {
    let command = request
        .command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let working_dir = shell_quote(&request.working_dir.to_string_lossy());
    let log_file = shell_quote(&request.log_file.to_string_lossy());
    format!(
        "mkdir -p {working_dir} && cd {working_dir} && \
         {DARK_MARK_ENV}={mark} setsid nohup {command} >> {log_file} 2>&1 < /dev/null & echo $!",
        mark = shell_quote(&request.dark_mark),
    )
}

impl DroneTransport for SshDrone {
    fn process_table(&self) -> TransportFuture<'_, Vec<ProcessRecord>> {
        Box::pin(async move {
            let output = self.run(&process_table_script()).await?;
            Ok(parse_process_table(&output))
        })
    }

    fn execute(&self, request: ExecuteRequest) -> TransportFuture<'_, u32> {
        Box::pin(async move {
            if request.command.is_empty() {
                bail!("empty command");
            }
            let output = self.run(&execute_script(&request)).await?;
            let pid: u32 = output
                .trim()
                .parse()
                .with_context(|| format!("unexpected pid output {output:?}"))?;
            info!(drone = %self.hostname, pid, tag = %request.tag, "remote process started");
            Ok(pid)
        })
    }

    fn kill(&self, pid: u32) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.run(&format!("kill -CONT {pid}; kill -TERM {pid}"))
                .await?;
            info!(drone = %self.hostname, pid, "remote process killed");
            Ok(())
        })
    }
}
