/// Core types and structures for the supervision core
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Launch parameters for one sandboxed child.
///
/// Immutable after launch. `cgroup` is the base group path relative to the
/// cgroup root; the launcher substitutes a unique child group beneath it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxParameter {
    /// Resource-group path, relative to the unified hierarchy root
    pub cgroup: PathBuf,
    /// CPU time limit in nanoseconds (`None` = unlimited)
    #[serde(default)]
    pub time_limit_ns: Option<u64>,
    /// Memory limit in bytes (`None` = unlimited)
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    /// Program to execute
    pub executable: PathBuf,
    /// Arguments passed after the program name
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Complete environment of the child (inherited environment is cleared)
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    /// Working directory of the child
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Redirect stdin from file
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    /// Redirect stdout to file
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    /// Redirect stderr to file
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

impl SandboxParameter {
    pub fn new(cgroup: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            cgroup: cgroup.into(),
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ns = Some(limit.as_nanos().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    /// Copy of this parameter with the resource group replaced.
    pub(crate) fn with_group(&self, group: &Path) -> Self {
        let mut resolved = self.clone();
        resolved.cgroup = group.to_path_buf();
        resolved
    }
}

/// Terminal status of a supervised run - closed set
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SandboxStatus {
    /// Exited normally within every limit
    #[serde(rename = "OK")]
    Ok,
    /// CPU time limit exceeded (soft trip or authoritative reading)
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    /// Peak memory exceeded the configured limit
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    /// Died by a signal not attributable to a limit
    #[serde(rename = "RE")]
    RuntimeError,
    /// Stopped by the caller
    #[serde(rename = "CANCELLED")]
    Cancelled,
    /// Resolver exhausted its rules; indicates a defect upstream
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 6] = [
        SandboxStatus::Ok,
        SandboxStatus::TimeLimitExceeded,
        SandboxStatus::MemoryLimitExceeded,
        SandboxStatus::RuntimeError,
        SandboxStatus::Cancelled,
        SandboxStatus::Unknown,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            SandboxStatus::Ok => "ok",
            SandboxStatus::TimeLimitExceeded => "time_limit_exceeded",
            SandboxStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            SandboxStatus::RuntimeError => "runtime_error",
            SandboxStatus::Cancelled => "cancelled",
            SandboxStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// How the backend reported the child's death
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationCause {
    /// Normal exit with the given code
    Exited(i32),
    /// Killed by the given signal
    Signaled(i32),
    /// Wait status carried neither an exit code nor a signal
    Unrecognized,
}

/// Where the reported memory figure came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemorySource {
    #[serde(rename = "peak")]
    Peak,
    #[serde(rename = "current")]
    Current,
    #[serde(rename = "unavailable")]
    Unavailable,
}

/// Final result of one supervised run
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SandboxResult {
    pub status: SandboxStatus,
    /// CPU time (nanoseconds). Authoritative, except that a soft-tripped run
    /// reports at least the accountant's estimate.
    pub time: u64,
    /// Accountant estimate at termination (nanoseconds); 0 when unlimited
    pub counted_time: u64,
    /// Memory usage in bytes, peak preferred
    pub memory: u64,
    pub memory_source: MemorySource,
    /// Exit code, present only for a natural exit
    pub code: Option<i32>,
    /// Terminating signal, present only for signal death
    pub signal: Option<i32>,
    /// Monotonic wall time from launch to termination (nanoseconds)
    pub wall_time_ns: u64,
}

/// Custom error types for the supervision core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Wait error: {0}")]
    Wait(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("shutdown grace {grace:?} exceeded; pending groups: {pending:?}")]
    ShutdownGraceExceeded {
        grace: Duration,
        pending: Vec<PathBuf>,
    },
}

impl SandboxError {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SandboxError::Launch(_) => "launch_error",
            SandboxError::Wait(_) => "wait_error",
            SandboxError::Cleanup(_) => "cleanup_error",
            SandboxError::Config(_) => "config_error",
            SandboxError::Cgroup(_) => "cgroup_error",
            SandboxError::Process(_) => "process_error",
            SandboxError::Io(_) => "io_error",
            SandboxError::ShutdownGraceExceeded { .. } => "shutdown_grace_exceeded",
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type alias for supervision operations
pub type Result<T> = std::result::Result<T, SandboxError>;
