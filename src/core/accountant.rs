//! CPU accountant.
//!
//! Estimates cumulative CPU time between authoritative readings and trips
//! the soft time limit. Each tick credits
//! `max(counter delta, occupancy_floor × wall elapsed)`, so a child cannot
//! hide behind a lagging counter. The estimate trips early by construction;
//! the figure reported in the result comes from the termination watcher.
//!
//! Counting stops at the trip. If the kill that follows fails, the
//! accountant keeps its timer and retries the kill on every later tick
//! until the child is reaped or the handle is cleaned up.

use crate::core::handle::HandleInner;
use crate::observability::audit::events;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// `limit / 10`, clamped to `[min, cap]`.
pub fn poll_interval(limit_ns: u64, min: Duration, cap: Duration) -> Duration {
    Duration::from_nanos(limit_ns / 10).max(min).min(cap)
}

/// Nanoseconds credited for one tick.
pub fn credit(delta_ns: u64, wall: Duration, occupancy_floor: f64) -> u64 {
    let floor_ns = (wall.as_nanos() as f64 * occupancy_floor) as u64;
    delta_ns.max(floor_ns)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    /// Estimate crossed the limit on this tick
    Tripped { counted_ns: u64 },
    /// Handle already cleaned up or child already reaped
    NotRunning,
}

impl HandleInner {
    /// One accounting step. The counter is read under the state lock.
    pub(crate) fn account_tick(
        &self,
        wall: Duration,
        occupancy_floor: f64,
        limit_ns: u64,
    ) -> TickOutcome {
        let mut state = self.lock_state();
        if !state.running || state.reaped {
            return TickOutcome::NotRunning;
        }

        // A failed read credits only the floor and keeps the last reading.
        let usage = self.read_cpu_usage();
        let delta = usage
            .map(|usage| usage.saturating_sub(state.actual_cpu_time))
            .unwrap_or(0);
        state.counted_cpu_time = state
            .counted_cpu_time
            .saturating_add(credit(delta, wall, occupancy_floor));
        if let Some(usage) = usage {
            state.actual_cpu_time = state.actual_cpu_time.max(usage);
        }

        if !state.timed_out && state.counted_cpu_time > limit_ns {
            state.timed_out = true;
            return TickOutcome::Tripped {
                counted_ns: state.counted_cpu_time,
            };
        }
        TickOutcome::Continue
    }

    /// Returns whether the kill was delivered.
    fn on_time_limit_trip(&self, counted_ns: u64, limit_ns: u64) -> bool {
        info!(
            "Soft time limit tripped for pid {} ({}): counted {}ns > limit {}ns",
            self.pid,
            self.group().display(),
            counted_ns,
            limit_ns
        );
        events::time_limit_tripped(self.group(), self.pid, counted_ns, limit_ns);
        self.metrics.time_limit_trips_total.inc();

        match self.request_termination() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to terminate pid {} after time-limit trip: {}", self.pid, e);
                false
            }
        }
    }

    /// Re-send the kill for a tripped child that survived it.
    fn retry_trip_kill(&self) -> bool {
        match self.request_termination() {
            Ok(()) => {
                info!("Time-limit kill of pid {} delivered on retry", self.pid);
                true
            }
            Err(e) => {
                debug!("Kill retry for pid {} failed: {}", self.pid, e);
                false
            }
        }
    }
}

/// Poll until the limit trips and the kill lands, the child is reaped, or
/// cleanup cancels us.
pub(crate) async fn run(
    inner: Arc<HandleInner>,
    limit_ns: u64,
    period: Duration,
    occupancy_floor: f64,
) {
    debug!(
        "Accountant for pid {} polling every {:?} (limit {}ns)",
        inner.pid, period, limit_ns
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = inner.launched_at;
    let mut kill_pending = false;

    loop {
        tokio::select! {
            _ = inner.poll_cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if kill_pending {
            // A reaped pid makes request_termination a no-op that succeeds.
            if inner.retry_trip_kill() {
                break;
            }
            continue;
        }

        let now = Instant::now();
        let wall = now.saturating_duration_since(last_tick);
        last_tick = now;

        match inner.account_tick(wall, occupancy_floor, limit_ns) {
            TickOutcome::Continue => {}
            TickOutcome::Tripped { counted_ns } => {
                if inner.on_time_limit_trip(counted_ns, limit_ns) {
                    break;
                }
                kill_pending = true;
            }
            TickOutcome::NotRunning => break,
        }
    }

    debug!("Accountant for pid {} stopped", inner.pid);
}
