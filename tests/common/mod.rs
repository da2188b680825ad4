//! Scripted in-memory isolation backend for supervision tests.
//!
//! Each started process follows a [`ProcessScript`]: it burns CPU at a
//! fixed rate of wall time, ends on its own after `runs_for` (or never),
//! and dies by SIGKILL when killed. All timing uses tokio's clock, so tests
//! running with a paused clock are deterministic.

#![allow(dead_code)]

use async_trait::async_trait;
use cgsupervisor::kernel::cgroup::{CPU_STAT, CPU_USAGE_USEC, MEMORY_CURRENT, MEMORY_PEAK};
use cgsupervisor::{
    Capability, HandleRegistry, IsolationBackend, Result, SandboxError, SandboxParameter,
    Supervisor, SupervisorConfig, TerminationCause,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct ProcessScript {
    /// CPU consumed per unit of wall time (1.0 = one busy core)
    pub cpu_rate: f64,
    /// Natural lifetime; `None` runs until killed
    pub runs_for: Option<Duration>,
    /// How the process ends on its own
    pub exit: TerminationCause,
    pub memory_peak: Option<u64>,
    pub memory_current: Option<u64>,
    /// `false` makes every cpu.stat read fail
    pub cpu_readable: bool,
    /// Backend wait fails with this message after `runs_for`
    pub wait_error: Option<String>,
}

impl Default for ProcessScript {
    fn default() -> Self {
        Self {
            cpu_rate: 1.0,
            runs_for: Some(Duration::from_millis(10)),
            exit: TerminationCause::Exited(0),
            memory_peak: Some(4 * 1024 * 1024),
            memory_current: Some(1024 * 1024),
            cpu_readable: true,
            wait_error: None,
        }
    }
}

impl ProcessScript {
    pub fn busy_forever() -> Self {
        Self {
            runs_for: None,
            ..Self::default()
        }
    }

    pub fn sleeping(duration: Duration) -> Self {
        Self {
            cpu_rate: 0.0,
            runs_for: Some(duration),
            ..Self::default()
        }
    }
}

struct Process {
    group: PathBuf,
    script: ProcessScript,
    started_at: Instant,
    ended_at: Option<Instant>,
    killed: Arc<Notify>,
}

impl Process {
    fn cpu_usec(&self, now: Instant) -> u64 {
        let mut end = self.ended_at.unwrap_or(now).min(now);
        if let Some(lifetime) = self.script.runs_for {
            end = end.min(self.started_at + lifetime);
        }
        let wall = end.saturating_duration_since(self.started_at);
        (wall.as_micros() as f64 * self.script.cpu_rate) as u64
    }
}

#[derive(Default)]
struct BackendState {
    queued: VecDeque<ProcessScript>,
    processes: HashMap<u32, Process>,
    next_pid: u32,
    start_attempts: Vec<PathBuf>,
    released: HashMap<PathBuf, usize>,
    kill_calls: usize,
    /// Kills that fail with EPERM and leave the process running
    kill_failures_left: usize,
    cpu_reads: usize,
    reads_after_release: usize,
}

pub struct ScriptedBackend {
    state: Mutex<BackendState>,
    capability: Capability,
    fail_start: bool,
    fail_release: bool,
    release_delay: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                next_pid: 10_000,
                ..BackendState::default()
            }),
            capability: Capability::Supported,
            fail_start: false,
            fail_release: false,
            release_delay: Duration::ZERO,
        }
    }

    pub fn unsupported(reason: &str) -> Self {
        Self {
            capability: Capability::Unsupported {
                reason: reason.to_string(),
            },
            ..Self::new()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    pub fn failing_release() -> Self {
        Self {
            fail_release: true,
            ..Self::new()
        }
    }

    pub fn slow_release(delay: Duration) -> Self {
        Self {
            release_delay: delay,
            ..Self::new()
        }
    }

    /// Script used by the next `start`; unscripted starts use the default.
    pub fn push_script(&self, script: ProcessScript) {
        self.state.lock().unwrap().queued.push_back(script);
    }

    /// The next `count` kills fail without ending the process.
    pub fn fail_next_kills(&self, count: usize) {
        self.state.lock().unwrap().kill_failures_left = count;
    }

    pub fn start_attempts(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().start_attempts.clone()
    }

    pub fn release_count(&self, group: &Path) -> usize {
        self.state
            .lock()
            .unwrap()
            .released
            .get(group)
            .copied()
            .unwrap_or(0)
    }

    pub fn kill_calls(&self) -> usize {
        self.state.lock().unwrap().kill_calls
    }

    pub fn cpu_reads(&self) -> usize {
        self.state.lock().unwrap().cpu_reads
    }

    pub fn reads_after_release(&self) -> usize {
        self.state.lock().unwrap().reads_after_release
    }

    fn with_process<T>(&self, group: &Path, read: impl FnOnce(&Process, Instant) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if state.released.contains_key(group) {
            state.reads_after_release += 1;
        }
        let now = Instant::now();
        state
            .processes
            .values()
            .find(|process| process.group == group)
            .map(|process| read(process, now))
    }
}

#[async_trait]
impl IsolationBackend for ScriptedBackend {
    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn capability(&self) -> Capability {
        self.capability.clone()
    }

    async fn start(&self, parameter: &SandboxParameter) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.start_attempts.push(parameter.cgroup.clone());
        if self.fail_start {
            return Err(SandboxError::Launch(format!(
                "permission denied creating {}",
                parameter.cgroup.display()
            )));
        }

        let script = state.queued.pop_front().unwrap_or_default();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            Process {
                group: parameter.cgroup.clone(),
                script,
                started_at: Instant::now(),
                ended_at: None,
                killed: Arc::new(Notify::new()),
            },
        );
        Ok(pid)
    }

    async fn await_termination(&self, pid: u32) -> Result<TerminationCause> {
        let (script, started_at, killed) = {
            let state = self.state.lock().unwrap();
            let process = state
                .processes
                .get(&pid)
                .ok_or_else(|| SandboxError::Wait(format!("unknown pid {}", pid)))?;
            (process.script.clone(), process.started_at, Arc::clone(&process.killed))
        };

        let runs_for = script.runs_for;
        let natural_end = async move {
            match runs_for {
                Some(lifetime) => tokio::time::sleep_until(started_at + lifetime).await,
                None => std::future::pending::<()>().await,
            }
        };

        let ended_naturally = tokio::select! {
            _ = natural_end => true,
            _ = killed.notified() => false,
        };

        let cause = if ended_naturally {
            if let Some(message) = script.wait_error {
                return Err(SandboxError::Wait(message));
            }
            script.exit
        } else {
            TerminationCause::Signaled(libc::SIGKILL)
        };

        let mut state = self.state.lock().unwrap();
        if let Some(process) = state.processes.get_mut(&pid) {
            process.ended_at.get_or_insert_with(Instant::now);
        }
        Ok(cause)
    }

    fn read_counter(&self, group: &Path, key: &str) -> Result<Option<u64>> {
        let value = self.with_process(group, |process, _| match key {
            MEMORY_PEAK => process.script.memory_peak,
            MEMORY_CURRENT => process.script.memory_current,
            _ => None,
        });
        Ok(value.flatten())
    }

    fn read_nested_counter(&self, group: &Path, file: &str, key: &str) -> Result<Option<u64>> {
        self.state.lock().unwrap().cpu_reads += 1;
        if file != CPU_STAT || key != CPU_USAGE_USEC {
            return Ok(None);
        }
        match self.with_process(group, |process, now| {
            (process.script.cpu_readable, process.cpu_usec(now))
        }) {
            Some((true, usec)) => Ok(Some(usec)),
            Some((false, _)) => Err(SandboxError::Cgroup("cpu.stat unreadable".to_string())),
            None => Ok(None),
        }
    }

    async fn release_group(&self, group: &Path) -> Result<()> {
        if !self.release_delay.is_zero() {
            tokio::time::sleep(self.release_delay).await;
        }
        *self
            .state
            .lock()
            .unwrap()
            .released
            .entry(group.to_path_buf())
            .or_insert(0) += 1;
        if self.fail_release {
            return Err(SandboxError::Cleanup(format!(
                "rmdir {}: device or resource busy",
                group.display()
            )));
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.kill_calls += 1;
        if state.kill_failures_left > 0 {
            state.kill_failures_left -= 1;
            return Err(SandboxError::Process(format!(
                "kill {}: operation not permitted",
                pid
            )));
        }
        if let Some(process) = state.processes.get_mut(&pid) {
            if process.ended_at.is_none() {
                process.ended_at = Some(Instant::now());
                process.killed.notify_one();
            }
        }
        Ok(())
    }
}

pub const BASE_GROUP: &str = "judge";

pub fn parameter() -> SandboxParameter {
    SandboxParameter::new(BASE_GROUP, "/usr/bin/solution")
}

/// Supervisor over `backend` with a private registry.
pub fn supervisor(backend: &Arc<ScriptedBackend>) -> Supervisor {
    let backend: Arc<dyn IsolationBackend> = backend.clone();
    Supervisor::with_registry(
        backend,
        SupervisorConfig::default(),
        Arc::new(HandleRegistry::new()),
    )
    .unwrap()
}
