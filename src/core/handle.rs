//! Supervised sandbox instance.
//!
//! A handle is shared by three activities: the CPU accountant's ticks, the
//! termination watcher, and caller operations (`stop`, `cleanup`). All of
//! them mutate [`SupervisionState`] under one mutex. Counter reads also
//! happen under that mutex, which is what makes "no reads after cleanup"
//! hold: cleanup flips `running` under the same lock.

use crate::config::types::{
    MemorySource, Result, SandboxError, SandboxParameter, SandboxResult, TerminationCause,
};
use crate::core::completion::Completion;
use crate::kernel::cgroup::{IsolationBackend, CPU_STAT, CPU_USAGE_USEC, MEMORY_CURRENT, MEMORY_PEAK};
use crate::observability::audit::events;
use crate::observability::metrics::SupervisorMetrics;
use crate::safety::cleanup;
use crate::safety::registry::HandleRegistry;
use crate::verdict::resolver::{OutcomeResolver, ResolverInput};
use log::{debug, info, warn};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable accounting state of one handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SupervisionState {
    /// Accountant estimate (ns), never decreases
    pub counted_cpu_time: u64,
    /// Last authoritative reading (ns)
    pub actual_cpu_time: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    /// True until cleanup runs
    pub running: bool,
    /// The pid is no longer tracked: death observed, or the wait failed
    pub reaped: bool,
}

impl SupervisionState {
    fn new() -> Self {
        Self {
            counted_cpu_time: 0,
            actual_cpu_time: 0,
            timed_out: false,
            cancelled: false,
            running: true,
            reaped: false,
        }
    }
}

/// Authoritative figures taken once the child is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FinalReadings {
    pub cpu_time_ns: u64,
    pub memory_bytes: Option<u64>,
    pub memory_source: MemorySource,
}

pub(crate) struct HandleInner {
    pub(crate) pid: u32,
    /// Parameter with the derived group path substituted in
    pub(crate) parameter: SandboxParameter,
    pub(crate) backend: Arc<dyn IsolationBackend>,
    pub(crate) state: Mutex<SupervisionState>,
    /// Stops the accountant's polling timer
    pub(crate) poll_cancel: CancellationToken,
    pub(crate) outcome: Completion<Result<SandboxResult>>,
    pub(crate) cleaned: Completion<Result<()>>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) metrics: Arc<SupervisorMetrics>,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) launched_at: Instant,
}

impl HandleInner {
    pub(crate) fn new(
        pid: u32,
        parameter: SandboxParameter,
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<HandleRegistry>,
        metrics: Arc<SupervisorMetrics>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            pid,
            parameter,
            backend,
            state: Mutex::new(SupervisionState::new()),
            poll_cancel: CancellationToken::new(),
            outcome: Completion::new(),
            cleaned: Completion::new(),
            registry,
            metrics,
            runtime,
            launched_at: Instant::now(),
        }
    }

    pub(crate) fn group(&self) -> &Path {
        &self.parameter.cgroup
    }

    /// State is plain data and consistent at every unlock, so a poisoned
    /// lock is still usable.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SupervisionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> SupervisionState {
        self.lock_state().clone()
    }

    /// SIGKILL the child unless its pid is no longer ours.
    pub(crate) fn request_termination(&self) -> Result<()> {
        let state = self.lock_state();
        if state.reaped {
            debug!("Skipping kill of pid {}: already terminated", self.pid);
            return Ok(());
        }
        // Held across the kill so the watcher cannot mark the pid reaped mid-call.
        self.backend.kill(self.pid)
    }

    /// Mark the run cancelled and send a best-effort kill.
    pub(crate) fn stop(&self) {
        let first = {
            let mut state = self.lock_state();
            let first = !state.cancelled;
            state.cancelled = true;
            first
        };
        if first {
            info!("Stop requested for pid {} ({})", self.pid, self.group().display());
            events::stop_requested(self.group(), self.pid);
        }

        if let Err(e) = self.request_termination() {
            debug!("Ignoring kill failure for pid {}: {}", self.pid, e);
        }
    }

    /// Peak memory (current as fallback) and cumulative CPU. Skipped
    /// entirely once cleanup has run.
    pub(crate) fn final_readings(&self) -> FinalReadings {
        let mut state = self.lock_state();
        if !state.running {
            warn!(
                "Group {} released before termination was observed; final readings unavailable",
                self.group().display()
            );
            return FinalReadings {
                cpu_time_ns: state.actual_cpu_time,
                memory_bytes: None,
                memory_source: MemorySource::Unavailable,
            };
        }

        let (memory_bytes, memory_source) = match self.read_memory(MEMORY_PEAK) {
            Some(peak) => (Some(peak), MemorySource::Peak),
            None => match self.read_memory(MEMORY_CURRENT) {
                Some(current) => (Some(current), MemorySource::Current),
                None => {
                    warn!("No memory counter readable for {}", self.group().display());
                    (None, MemorySource::Unavailable)
                }
            },
        };

        let cpu_time_ns = match self.read_cpu_usage() {
            Some(usage) => {
                state.actual_cpu_time = state.actual_cpu_time.max(usage);
                usage
            }
            None => {
                warn!(
                    "Final CPU reading unavailable for {}; using last accountant reading",
                    self.group().display()
                );
                state.actual_cpu_time
            }
        };

        FinalReadings {
            cpu_time_ns,
            memory_bytes,
            memory_source,
        }
    }

    fn read_memory(&self, key: &str) -> Option<u64> {
        match self.backend.read_counter(self.group(), key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {} for {}: {}", key, self.group().display(), e);
                None
            }
        }
    }

    /// Cumulative CPU usage in nanoseconds. Caller holds the state lock.
    pub(crate) fn read_cpu_usage(&self) -> Option<u64> {
        match self
            .backend
            .read_nested_counter(self.group(), CPU_STAT, CPU_USAGE_USEC)
        {
            Ok(Some(usec)) => Some(usec.saturating_mul(1000)),
            Ok(None) => {
                debug!("{} {} unavailable for {}", CPU_STAT, CPU_USAGE_USEC, self.group().display());
                None
            }
            Err(e) => {
                warn!("Failed to read {} for {}: {}", CPU_STAT, self.group().display(), e);
                None
            }
        }
    }
}

/// Await the child's death, resolve the outcome and trigger cleanup.
/// Self-induced kills take the same path as any other death.
pub(crate) async fn watch_termination(inner: Arc<HandleInner>) {
    let cause = match inner.backend.await_termination(inner.pid).await {
        Ok(cause) => cause,
        Err(e) => {
            let error = match e {
                SandboxError::Wait(_) => e,
                other => SandboxError::Wait(other.to_string()),
            };
            warn!("Wait for pid {} failed: {}", inner.pid, error);
            events::wait_failed(inner.group(), inner.pid, &error);
            inner.metrics.wait_failures_total.inc();

            inner.stop();
            inner.lock_state().reaped = true;
            cleanup::cleanup(&inner);
            inner.outcome.resolve(Err(error));
            return;
        }
    };

    let wall_time_ns = inner.launched_at.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    inner.lock_state().reaped = true;

    let (code, signal) = match cause {
        TerminationCause::Exited(code) => (Some(code), None),
        TerminationCause::Signaled(signal) => (None, Some(signal)),
        TerminationCause::Unrecognized => (None, None),
    };
    events::terminated(inner.group(), inner.pid, code, signal);

    let readings = inner.final_readings();
    let flags = inner.snapshot();

    cleanup::cleanup(&inner);

    let status = OutcomeResolver::resolve(&ResolverInput {
        timed_out: flags.timed_out,
        cancelled: flags.cancelled,
        cpu_time_ns: readings.cpu_time_ns,
        memory_bytes: readings.memory_bytes,
        termination: cause,
        time_limit_ns: inner.parameter.time_limit_ns,
        memory_limit_bytes: inner.parameter.memory_limit_bytes,
    });

    // A sleeping child can trip the estimate with almost no real CPU.
    let time = if flags.timed_out {
        readings.cpu_time_ns.max(flags.counted_cpu_time)
    } else {
        readings.cpu_time_ns
    };

    let result = SandboxResult {
        status,
        time,
        counted_time: flags.counted_cpu_time,
        memory: readings.memory_bytes.unwrap_or(0),
        memory_source: readings.memory_source,
        code,
        signal,
        wall_time_ns,
    };

    info!(
        "Sandbox {} (pid {}) finished: {} time={}ns memory={}B",
        inner.group().display(),
        inner.pid,
        result.status,
        result.time,
        result.memory
    );
    events::outcome_resolved(inner.group(), inner.pid, status, result.time, result.memory);
    inner.metrics.record_outcome(status);
    inner.outcome.resolve(Ok(result));
}

/// A live supervised sandbox. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<HandleInner>,
}

impl SandboxHandle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Parameter as launched, with the derived group path.
    pub fn parameter(&self) -> &SandboxParameter {
        &self.inner.parameter
    }

    pub fn group_path(&self) -> &Path {
        self.inner.group()
    }

    /// False once cleanup has run.
    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn counted_cpu_time(&self) -> u64 {
        self.inner.lock_state().counted_cpu_time
    }

    pub fn actual_cpu_time(&self) -> u64 {
        self.inner.lock_state().actual_cpu_time
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.lock_state().timed_out
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock_state().cancelled
    }

    /// Request termination. Never fails; the outcome arrives through [`wait`](Self::wait).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Outcome of the run. May be awaited any number of times.
    pub async fn wait(&self) -> Result<SandboxResult> {
        self.inner.outcome.wait().await
    }

    /// Result of releasing the resource group, independent of the outcome.
    pub async fn wait_cleaned_up(&self) -> Result<()> {
        self.inner.cleaned.wait().await
    }

    /// Outcome if already resolved.
    pub fn try_result(&self) -> Option<Result<SandboxResult>> {
        self.inner.outcome.peek()
    }

    /// Release the handle's resources now. Returns whether this call did the
    /// work; later calls are no-ops.
    pub fn cleanup(&self) -> bool {
        cleanup::cleanup(&self.inner)
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("pid", &self.inner.pid)
            .field("group", &self.inner.group())
            .field("state", &self.inner.snapshot())
            .finish()
    }
}
