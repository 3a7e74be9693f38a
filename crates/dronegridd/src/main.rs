//! dronegridd — the DroneGrid scheduler daemon.
//!
//! Assembles the scheduler subsystems into one process:
//! - State store (redb)
//! - Drone manager with local and ssh transports
//! - Dispatcher tick loop with periodic cleanup
//! - Status page
//!
//! # Usage
//!
//! ```text
//! dronegridd run --config /etc/dronegrid/dronegrid.toml --data-dir /var/lib/dronegrid
//! dronegridd check-config /etc/dronegrid/dronegrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dronegrid_config::{ConfigSource, SchedulerConfig};
use dronegrid_dispatcher::Dispatcher;
use dronegrid_drones::default_transport_factory;
use dronegrid_notify::{EmailNotificationManager, LogMailSink};
use dronegrid_state::StateStore;
use dronegrid_status::StatusServer;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,dronegridd=debug,dronegrid=debug";

#[derive(Parser)]
#[command(name = "dronegridd", about = "DroneGrid scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Run {
        /// Scheduler configuration file.
        #[arg(long, default_value = "/etc/dronegrid/dronegrid.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/dronegrid")]
        data_dir: PathBuf,

        /// Queue cleanup for hosts left in Repair Failed at startup.
        #[arg(long)]
        recover_hosts: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            recover_hosts,
            log_json,
        } => {
            init_tracing(log_json);
            run_scheduler(&config, &data_dir, recover_hosts).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            check_config(&config)
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    for (key, value) in config.describe() {
        println!("{key} = {value}");
    }
    Ok(())
}

async fn run_scheduler(config_path: &Path, data_dir: &Path, recover: bool) -> anyhow::Result<()> {
    info!("DroneGrid scheduler starting");

    let source = ConfigSource::load(config_path)
        .with_context(|| format!("loading configuration {}", config_path.display()))?;
    let config = source.current().clone();
    if !config.scheduler.enable_scheduler {
        anyhow::bail!(
            "scheduler is disabled in {} (enable_scheduler = false)",
            config_path.display()
        );
    }

    // ── Subsystems ──────────────────────────────────────────────

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("dronegrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = %db_path.display(), "state store opened");

    let notifier = Arc::new(EmailNotificationManager::new(
        config.scheduler.notify_email_from.clone(),
        config.scheduler.notify_email_to.clone(),
        Arc::new(LogMailSink),
    ));

    let mut dispatcher = Dispatcher::new(store, source, notifier, default_transport_factory())?;
    dispatcher.initialize(recover).await?;

    let port = config.scheduler.status_server_port;
    let status = if port == 0 {
        info!("status server disabled");
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Some(StatusServer::start(addr, dispatcher.status_state()).await?)
    };

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c; stop the process with SIGKILL");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;

    if let Some(server) = status {
        server.shutdown().await?;
    }
    info!("DroneGrid scheduler stopped");
    Ok(())
}
