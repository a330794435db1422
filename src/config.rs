/// Server configuration
///
/// Loaded from an optional JSON file; every field has a default so an empty
/// object (or no file at all) yields a runnable server.

use crate::error::{MushError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime settings for `mushd`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub listen_addr: String,

    /// Directory holding the current snapshot
    pub data_dir: PathBuf,

    /// Name of the current snapshot inside `data_dir`
    pub current_file: String,

    /// Backup directory, relative to `data_dir` unless absolute
    pub backup_dir: PathBuf,

    /// Seconds between automatic saves
    pub save_interval_secs: u64,

    /// How long one accept attempt waits before re-checking for shutdown
    pub accept_poll_millis: u64,

    /// Depth of the world store request queue
    pub request_queue: usize,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            data_dir: PathBuf::from("."),
            current_file: "world.json".to_string(),
            backup_dir: PathBuf::from("backup"),
            save_interval_secs: 60 * 60,
            accept_poll_millis: 1000,
            request_queue: 256,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read and validate a JSON config file
    ///
    /// # Errors
    /// - `MushError::IoError`: the file could not be read
    /// - `MushError::JsonError`: the file is not valid JSON for this type
    /// - `MushError::ConfigError`: a value failed validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, otherwise defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(invalid("listen_addr", "cannot be empty"));
        }
        if self.current_file.trim().is_empty() {
            return Err(invalid("current_file", "cannot be empty"));
        }
        if self.save_interval_secs == 0 {
            return Err(invalid("save_interval_secs", "must be positive"));
        }
        if self.accept_poll_millis == 0 {
            return Err(invalid("accept_poll_millis", "must be positive"));
        }
        if self.request_queue == 0 {
            return Err(invalid("request_queue", "must be positive"));
        }
        if self.save_interval_secs < 60 {
            warn!("Saving every {}s; snapshots will pile up quickly", self.save_interval_secs);
        }
        Ok(())
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_millis)
    }
}

fn invalid(field: &str, reason: &str) -> MushError {
    warn!("Configuration validation failed: {} {}", field, reason);
    MushError::ConfigError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
