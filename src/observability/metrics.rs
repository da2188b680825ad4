/// Process-wide supervision counters with Prometheus text export
use crate::config::types::SandboxStatus;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Up/down gauge
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    pub launches_total: Counter,
    pub launch_failures_total: Counter,
    pub time_limit_trips_total: Counter,
    pub wait_failures_total: Counter,
    pub cleanup_success_total: Counter,
    pub cleanup_failure_total: Counter,
    pub live_sandboxes: Gauge,
    outcomes: [Counter; 6],
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn status_index(status: SandboxStatus) -> usize {
        match status {
            SandboxStatus::Ok => 0,
            SandboxStatus::TimeLimitExceeded => 1,
            SandboxStatus::MemoryLimitExceeded => 2,
            SandboxStatus::RuntimeError => 3,
            SandboxStatus::Cancelled => 4,
            SandboxStatus::Unknown => 5,
        }
    }

    pub fn record_outcome(&self, status: SandboxStatus) {
        self.outcomes[Self::status_index(status)].inc();
    }

    pub fn outcome_count(&self, status: SandboxStatus) -> u64 {
        self.outcomes[Self::status_index(status)].get()
    }

    /// Export in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("cgsupervisor_launches_total", "Sandboxes launched", &self.launches_total),
            ("cgsupervisor_launch_failures_total", "Launches rejected", &self.launch_failures_total),
            ("cgsupervisor_time_limit_trips_total", "Soft CPU time-limit trips", &self.time_limit_trips_total),
            ("cgsupervisor_wait_failures_total", "Backend wait failures", &self.wait_failures_total),
            ("cgsupervisor_cleanup_success_total", "Resource groups released", &self.cleanup_success_total),
            ("cgsupervisor_cleanup_failure_total", "Resource group release failures", &self.cleanup_failure_total),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counter.get()));
        }

        output.push_str("# HELP cgsupervisor_outcomes_total Resolved outcomes by status\n");
        output.push_str("# TYPE cgsupervisor_outcomes_total counter\n");
        for status in SandboxStatus::ALL {
            output.push_str(&format!(
                "cgsupervisor_outcomes_total{{status=\"{}\"}} {}\n",
                status.as_label(),
                self.outcome_count(status)
            ));
        }

        output.push_str("# HELP cgsupervisor_live_sandboxes Handles not yet cleaned up\n");
        output.push_str("# TYPE cgsupervisor_live_sandboxes gauge\n");
        output.push_str(&format!(
            "cgsupervisor_live_sandboxes {}\n",
            self.live_sandboxes.get()
        ));

        output
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<SupervisorMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(SupervisorMetrics::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<SupervisorMetrics> {
    Arc::clone(&METRICS)
}
