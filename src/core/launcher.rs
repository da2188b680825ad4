//! Launcher.
//!
//! Derives a unique child group under the caller's base path, asks the
//! backend to start the child there and hands back a live
//! [`SandboxHandle`] with its watcher (and accountant, when time is
//! limited) already running.

use crate::config::settings::SupervisorConfig;
use crate::config::types::{Result, SandboxError, SandboxParameter};
use crate::config::validator::validate_parameter;
use crate::core::accountant;
use crate::core::handle::{self, HandleInner, SandboxHandle};
use crate::core::token::generate_group_token;
use crate::kernel::cgroup::{Capability, CgroupV2Backend, IsolationBackend};
use crate::kernel::signal;
use crate::observability::audit::events;
use crate::observability::metrics::{get_metrics, SupervisorMetrics};
use crate::safety::registry::{GroupReservation, HandleRegistry};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fresh tokens drawn before giving up on a collision-free group path
pub const MAX_TOKEN_DRAWS: usize = 8;

pub struct Supervisor {
    backend: Arc<dyn IsolationBackend>,
    config: SupervisorConfig,
    registry: Arc<HandleRegistry>,
    metrics: Arc<SupervisorMetrics>,
    capability: Capability,
}

impl Supervisor {
    /// Supervisor over `backend`, tracked in the process-wide registry.
    /// The backend's host capability is probed here, once.
    pub fn new(backend: Arc<dyn IsolationBackend>, config: SupervisorConfig) -> Result<Self> {
        Self::with_registry(backend, config, HandleRegistry::global())
    }

    pub fn with_registry(
        backend: Arc<dyn IsolationBackend>,
        config: SupervisorConfig,
        registry: Arc<HandleRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let capability = backend.capability();
        match &capability {
            Capability::Supported => {
                info!("Supervisor ready on {} backend", backend.backend_name())
            }
            Capability::Unsupported { reason } => warn!(
                "{} backend unavailable, every launch will fail: {}",
                backend.backend_name(),
                reason
            ),
        }

        Ok(Self {
            backend,
            config,
            registry,
            metrics: get_metrics(),
            capability,
        })
    }

    /// Production supervisor on the host's unified cgroup hierarchy.
    pub fn cgroup_v2(config: SupervisorConfig) -> Result<Self> {
        let backend = Arc::new(CgroupV2Backend::new(&config));
        Self::new(backend, config)
    }

    pub fn with_metrics(mut self, metrics: Arc<SupervisorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<SupervisorMetrics> {
        &self.metrics
    }

    /// Stop and clean up every live handle of this supervisor's registry
    /// when the host receives a termination signal.
    pub fn install_shutdown_hook(&self) -> JoinHandle<()> {
        signal::install_shutdown_hook(Arc::clone(&self.registry), self.config.shutdown_grace())
    }

    /// Launch a sandboxed child. No handle is produced on failure, and the
    /// derived group path is released again.
    pub async fn start(&self, parameter: SandboxParameter) -> Result<SandboxHandle> {
        if let Capability::Unsupported { reason } = &self.capability {
            self.metrics.launch_failures_total.inc();
            let error = SandboxError::Config(format!("host capability unavailable: {}", reason));
            events::launch_failed(&parameter.cgroup, &error);
            return Err(error);
        }

        if let Err(e) = validate_parameter(&parameter) {
            self.metrics.launch_failures_total.inc();
            events::launch_failed(&parameter.cgroup, &e);
            return Err(e);
        }

        let reservation = self.reserve_group(&parameter.cgroup)?;
        let resolved = parameter.with_group(reservation.path());

        let pid = match self.backend.start(&resolved).await {
            Ok(pid) => pid,
            Err(e) => {
                let error = match e {
                    SandboxError::Launch(_) => e,
                    other => SandboxError::Launch(other.to_string()),
                };
                warn!("Launch in {} failed: {}", resolved.cgroup.display(), error);
                self.metrics.launch_failures_total.inc();
                events::launch_failed(&resolved.cgroup, &error);
                return Err(error);
            }
        };

        let time_limit_ns = resolved.time_limit_ns;
        let inner = Arc::new(HandleInner::new(
            pid,
            resolved,
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            tokio::runtime::Handle::current(),
        ));
        reservation.activate(Arc::clone(&inner));

        info!("Launched pid {} in {}", pid, inner.group().display());
        events::launched(inner.group(), pid);
        self.metrics.launches_total.inc();
        self.metrics.live_sandboxes.inc();

        tokio::spawn(handle::watch_termination(Arc::clone(&inner)));

        if let Some(limit_ns) = time_limit_ns {
            let period = accountant::poll_interval(
                limit_ns,
                self.config.min_poll_interval(),
                self.config.poll_interval_cap(),
            );
            tokio::spawn(accountant::run(
                Arc::clone(&inner),
                limit_ns,
                period,
                self.config.cpu_occupancy_floor,
            ));
        } else {
            debug!("No time limit for pid {}; accountant not started", pid);
        }

        Ok(SandboxHandle::from_inner(inner))
    }

    fn reserve_group(&self, base: &Path) -> Result<GroupReservation> {
        let token_len = self.config.token_len();
        for _ in 0..MAX_TOKEN_DRAWS {
            let candidate = base.join(generate_group_token(token_len));
            if let Some(reservation) = self.registry.try_reserve(&candidate) {
                return Ok(reservation);
            }
            debug!("Group token collision on {}", candidate.display());
        }

        self.metrics.launch_failures_total.inc();
        let error = SandboxError::Launch(format!(
            "no unique group path under {} after {} attempts",
            base.display(),
            MAX_TOKEN_DRAWS
        ));
        events::launch_failed(base, &error);
        Err(error)
    }
}
