//! Local drone — runs processes on the scheduler's own machine.

use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::process::{DARK_MARK_ENV, ProcessInspector, ProcessRecord};
use crate::transport::{DroneTransport, ExecuteRequest, TransportFuture};

pub struct LocalDrone {
    inspector: Arc<dyn ProcessInspector>,
}

impl LocalDrone {
    pub fn new(inspector: impl ProcessInspector + 'static) -> Self {
        Self {
            inspector: Arc::new(inspector),
        }
    }
}

impl DroneTransport for LocalDrone {
    fn process_table(&self) -> TransportFuture<'_, Vec<ProcessRecord>> {
        let inspector = self.inspector.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || inspector.process_table())
                .await
                .context("process table reader panicked")?
        })
    }

    fn execute(&self, request: ExecuteRequest) -> TransportFuture<'_, u32> {
        Box::pin(async move {
            let (program, args) = request
                .command
                .split_first()
                .context("empty command")?;
            std::fs::create_dir_all(&request.working_dir).with_context(|| {
                format!("creating {}", request.working_dir.display())
            })?;
            if let Some(parent) = request.log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&request.log_file)
                .with_context(|| format!("opening {}", request.log_file.display()))?;

            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args)
                .current_dir(&request.working_dir)
                .env(DARK_MARK_ENV, &request.dark_mark)
                .stdin(Stdio::null())
                .stdout(log.try_clone()?)
                .stderr(log)
                .process_group(0);
            debug!(?cmd, tag = %request.tag, "spawning local process");

            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawning {program}"))?;
            let pid = child.id().context("spawned process has no pid")?;
            info!(pid, tag = %request.tag, "local process started");

            // Reap the child so it leaves the process table once it exits.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(pid)
        })
    }

    fn kill(&self, pid: u32) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let pid = i32::try_from(pid).context("pid out of range")?;
            // SAFETY: kill(2) has no memory safety preconditions.
            if unsafe { libc::kill(pid, libc::SIGCONT) } != 0 {
                let err = std::io::Error::last_os_error();
                debug!(pid, error = %err, "SIGCONT failed");
            }
            // SAFETY: as above.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("sending SIGTERM to {pid}"));
            }
            info!(pid, "local process killed");
            Ok(())
        })
    }
}
