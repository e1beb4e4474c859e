//! Coordinator configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use itc_core::{DEFAULT_SOCKET_DIR, MAX_PROCESSES};

use crate::error::{CoordError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Directory holding the well-known and per-process sockets.
    pub socket_dir: PathBuf,
    /// Number of process slots, at most [`MAX_PROCESSES`].
    pub max_processes: u32,
    /// Size of the Coordinator's own mailbox table.
    pub mailbox_count: usize,
    /// Namespace reported in locate replies.
    pub namespace: String,
    /// Length of one service-loop iteration.
    pub tick_ms: u64,
    /// Iterations a slot may stay listening before its process is probed.
    pub zombie_ticks: u32,
    /// Probe every listening slot while fewer slots than this are free.
    pub low_water: usize,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            max_processes: 64,
            mailbox_count: 16,
            namespace: String::new(),
            tick_ms: 1000,
            zombie_ticks: 10,
            low_water: 2,
        }
    }
}

impl CoordConfig {
    /// Read a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_processes == 0 || self.max_processes > MAX_PROCESSES {
            return Err(CoordError::Config(format!(
                "max_processes must be between 1 and {}, got {}",
                MAX_PROCESSES, self.max_processes
            )));
        }
        if self.tick_ms == 0 {
            return Err(CoordError::Config("tick_ms must be positive".to_string()));
        }
        if self.zombie_ticks == 0 {
            return Err(CoordError::Config(
                "zombie_ticks must be positive".to_string(),
            ));
        }
        if self.mailbox_count == 0 {
            return Err(CoordError::Config(
                "mailbox_count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
