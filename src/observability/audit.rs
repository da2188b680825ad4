/// Structured supervision events
/// Every lifecycle transition of a sandbox handle is emitted as one JSON
/// record on the `cgsupervisor::audit` log target, so hosts can route the
/// audit trail separately from diagnostic logging.
use crate::config::types::{SandboxError, SandboxStatus};
use chrono::{DateTime, Utc};
use log::Level;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log target carrying the audit trail
pub const AUDIT_TARGET: &str = "cgsupervisor::audit";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl EventSeverity {
    fn log_level(self) -> Level {
        match self {
            EventSeverity::Critical | EventSeverity::High => Level::Error,
            EventSeverity::Medium => Level::Warn,
            EventSeverity::Low => Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    Launched,
    LaunchFailed { error: String },
    TimeLimitTripped { counted_ns: u64, limit_ns: u64 },
    StopRequested,
    Terminated { code: Option<i32>, signal: Option<i32> },
    OutcomeResolved { status: SandboxStatus, time_ns: u64, memory_bytes: u64 },
    CleanupSucceeded,
    CleanupFailed { error: String },
    WaitFailed { error: String },
    ShutdownHookFired { live_handles: usize },
}

impl EventKind {
    pub fn default_severity(&self) -> EventSeverity {
        match self {
            EventKind::Launched
            | EventKind::StopRequested
            | EventKind::Terminated { .. }
            | EventKind::OutcomeResolved { .. }
            | EventKind::CleanupSucceeded => EventSeverity::Low,
            EventKind::TimeLimitTripped { .. } | EventKind::ShutdownHookFired { .. } => {
                EventSeverity::Medium
            }
            EventKind::LaunchFailed { .. } | EventKind::WaitFailed { .. } => EventSeverity::High,
            EventKind::CleanupFailed { .. } => EventSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisionEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub group: Option<PathBuf>,
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SupervisionEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: kind.default_severity(),
            group: None,
            pid: None,
            kind,
        }
    }

    pub fn with_group(mut self, group: &Path) -> Self {
        self.group = Some(group.to_path_buf());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"event_type\":\"unserializable\",\"error\":\"{}\"}}", e)
        })
    }
}

/// Write an event to the audit log target.
pub fn emit(event: SupervisionEvent) {
    log::log!(target: AUDIT_TARGET, event.severity.log_level(), "{}", event.to_json());
}

/// Convenience constructors for the common events
pub mod events {
    use super::*;

    pub fn launched(group: &Path, pid: u32) {
        emit(SupervisionEvent::new(EventKind::Launched).with_group(group).with_pid(pid));
    }

    pub fn launch_failed(group: &Path, error: &SandboxError) {
        emit(
            SupervisionEvent::new(EventKind::LaunchFailed {
                error: error.to_string(),
            })
            .with_group(group),
        );
    }

    pub fn time_limit_tripped(group: &Path, pid: u32, counted_ns: u64, limit_ns: u64) {
        emit(
            SupervisionEvent::new(EventKind::TimeLimitTripped {
                counted_ns,
                limit_ns,
            })
            .with_group(group)
            .with_pid(pid),
        );
    }

    pub fn stop_requested(group: &Path, pid: u32) {
        emit(SupervisionEvent::new(EventKind::StopRequested).with_group(group).with_pid(pid));
    }

    pub fn terminated(group: &Path, pid: u32, code: Option<i32>, signal: Option<i32>) {
        emit(
            SupervisionEvent::new(EventKind::Terminated { code, signal })
                .with_group(group)
                .with_pid(pid),
        );
    }

    pub fn outcome_resolved(group: &Path, pid: u32, status: SandboxStatus, time_ns: u64, memory_bytes: u64) {
        emit(
            SupervisionEvent::new(EventKind::OutcomeResolved {
                status,
                time_ns,
                memory_bytes,
            })
            .with_group(group)
            .with_pid(pid),
        );
    }

    pub fn cleanup_succeeded(group: &Path) {
        emit(SupervisionEvent::new(EventKind::CleanupSucceeded).with_group(group));
    }

    pub fn cleanup_failed(group: &Path, error: &SandboxError) {
        emit(
            SupervisionEvent::new(EventKind::CleanupFailed {
                error: error.to_string(),
            })
            .with_group(group),
        );
    }

    pub fn wait_failed(group: &Path, pid: u32, error: &SandboxError) {
        emit(
            SupervisionEvent::new(EventKind::WaitFailed {
                error: error.to_string(),
            })
            .with_group(group)
            .with_pid(pid),
        );
    }

    pub fn shutdown_hook_fired(live_handles: usize) {
        emit(SupervisionEvent::new(EventKind::ShutdownHookFired { live_handles }));
    }
}
