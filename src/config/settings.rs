/// Supervisor tunables, loadable from JSON
use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const MIN_TOKEN_LEN: usize = 6;
pub const MAX_TOKEN_LEN: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Mount point of the unified hierarchy
    pub cgroup_root: PathBuf,
    /// Upper bound of the CPU poll interval
    pub poll_interval_cap_ms: u64,
    /// Lower bound of the CPU poll interval
    pub min_poll_interval_ms: u64,
    /// Minimum CPU fraction of wall time credited per tick
    pub cpu_occupancy_floor: f64,
    /// Length of the generated child-group token
    pub group_token_len: usize,
    /// Wait budget for cleanups during host shutdown
    pub shutdown_grace_ms: u64,
    /// Slack added on top of the memory limit when writing memory.max
    pub memory_limit_headroom_bytes: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            poll_interval_cap_ms: 50,
            min_poll_interval_ms: 1,
            cpu_occupancy_floor: 0.4,
            group_token_len: 9,
            shutdown_grace_ms: 2000,
            memory_limit_headroom_bytes: 1024 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| SandboxError::Config(format!("Failed to parse supervisor config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.cgroup_root.is_absolute() {
            errors.push(format!(
                "cgroup_root must be absolute: {}",
                self.cgroup_root.display()
            ));
        }
        if self.poll_interval_cap_ms == 0 {
            errors.push("poll_interval_cap_ms cannot be zero".to_string());
        }
        if self.min_poll_interval_ms == 0 {
            errors.push("min_poll_interval_ms cannot be zero".to_string());
        }
        if self.min_poll_interval_ms > self.poll_interval_cap_ms {
            errors.push(format!(
                "min_poll_interval_ms ({}) must be <= poll_interval_cap_ms ({})",
                self.min_poll_interval_ms, self.poll_interval_cap_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.cpu_occupancy_floor) || self.cpu_occupancy_floor.is_nan() {
            errors.push(format!(
                "cpu_occupancy_floor must be within [0, 1]: {}",
                self.cpu_occupancy_floor
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Config(errors.join("; ")))
        }
    }

    pub fn poll_interval_cap(&self) -> Duration {
        Duration::from_millis(self.poll_interval_cap_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Token length clamped to the supported range.
    pub fn token_len(&self) -> usize {
        self.group_token_len.clamp(MIN_TOKEN_LEN, MAX_TOKEN_LEN)
    }
}
