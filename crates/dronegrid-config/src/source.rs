//! Reloadable configuration source.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::ConfigResult;

/// The active configuration plus the file it was read from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    current: SchedulerConfig,
}

impl ConfigSource {
    /// Load a configuration file, failing if it is unreadable or invalid.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let current = SchedulerConfig::from_file(path)?;
        info!(path = %path.display(), drones = current.drones.len(), "configuration loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            current,
        })
    }

    /// A source with no backing file; `reload` keeps the given config.
    pub fn fixed(config: SchedulerConfig) -> Self {
        Self {
            path: None,
            current: config,
        }
    }

    pub fn current(&self) -> &SchedulerConfig {
        &self.current
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file.
    ///
    /// On any error the previous configuration stays active and the error
    /// is returned to the caller.
    pub fn reload(&mut self) -> ConfigResult<&SchedulerConfig> {
        let Some(path) = &self.path else {
            return Ok(&self.current);
        };
        match SchedulerConfig::from_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration reloaded");
                self.current = config;
                Ok(&self.current)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "configuration reload failed, keeping previous");
                Err(e)
            }
        }
    }
}
