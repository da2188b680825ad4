//! cgsupervisor: supervision core for cgroup v2 sandboxes
//! Runs one untrusted child per resource group, enforces CPU-time and memory
//! budgets, and resolves a single definitive outcome once the child dies.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: isolation backend seam and the cgroup v2 backend
//! - [`kernel::signal`]: SIGKILL delivery and host shutdown signals
//!
//! ## Supervision Core ([`core`])
//! - [`core::launcher`]: unique group derivation and child launch
//! - [`core::accountant`]: drift-tolerant CPU estimate and soft time-limit trip
//! - [`core::handle`]: shared handle state, stop, termination watcher
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::resolver`]: fixed-priority outcome classification
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: exactly-once resource-group release
//! - [`safety::registry`]: live-handle registry and host shutdown routine
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured supervision events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: parameters, results, statuses, errors
//! - [`config::settings`]: supervisor tunables
//! - [`config::validator`]: launch-time parameter validation
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - reported CPU and memory come from cgroup counters
//! 2. **Estimates only trip** - the accountant may end a run early, never report it
//! 3. **Cleanup exactly once** - from any exit path, isolated from the outcome
//! 4. **No silent defects** - an unclassifiable run is `Unknown` and logged as an error

// Kernel Primitives
pub mod kernel;

// Supervision Core
pub mod core;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

pub use crate::config::settings::SupervisorConfig;
pub use crate::config::types::*;
pub use crate::core::handle::SandboxHandle;
pub use crate::core::launcher::Supervisor;
pub use crate::kernel::cgroup::{Capability, CgroupV2Backend, IsolationBackend};
pub use crate::safety::registry::HandleRegistry;
