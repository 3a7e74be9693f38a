//! dronegrid-config — the scheduler's reloadable TOML configuration.
//!
//! A single `dronegrid.toml` carries a `[scheduler]` table of named scalar
//! options and one `[drones.<hostname>]` table per worker machine.
//! [`ConfigSource`] remembers where the file came from so the status
//! server can ask for a live re-read.

pub mod config;
pub mod error;
pub mod source;

pub use config::{DroneConfig, SchedulerConfig, SchedulerSection, TransportKind};
pub use error::{ConfigError, ConfigResult};
pub use source::ConfigSource;
