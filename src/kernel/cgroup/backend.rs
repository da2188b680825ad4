//! Isolation backend abstraction.
//!
//! The backend is the primitive that starts a confined child, exposes its
//! resource-group counters and removes the group. The supervision core only
//! talks to this trait.

use crate::config::types::{Result, SandboxParameter, TerminationCause};
use crate::kernel::signal;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

/// Whether the host can run sandboxes at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported,
    Unsupported { reason: String },
}

impl Capability {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported)
    }
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Host precondition. Evaluated once when a supervisor is built.
    fn capability(&self) -> Capability;

    /// Create `parameter.cgroup` and start the child inside it. Returns the pid.
    async fn start(&self, parameter: &SandboxParameter) -> Result<u32>;

    /// One-shot wait for the child's death.
    async fn await_termination(&self, pid: u32) -> Result<TerminationCause>;

    /// Read a single-value counter file. `Ok(None)` means the counter is unavailable.
    fn read_counter(&self, group: &Path, key: &str) -> Result<Option<u64>>;

    /// Read one `key value` entry of a flat-keyed counter file.
    fn read_nested_counter(&self, group: &Path, file: &str, key: &str) -> Result<Option<u64>>;

    /// Remove the resource group.
    async fn release_group(&self, group: &Path) -> Result<()>;

    /// Deliver SIGKILL to the child.
    fn kill(&self, pid: u32) -> Result<()> {
        signal::kill_process(pid)
    }
}

/// Marker file present only on a unified (v2) hierarchy
pub const UNIFIED_MARKER: &str = "cgroup.controllers";

/// Check for a unified hierarchy under `root`.
pub fn detect_unified_hierarchy(root: &Path) -> Capability {
    if root.join(UNIFIED_MARKER).exists() {
        Capability::Supported
    } else {
        Capability::Unsupported {
            reason: format!(
                "cgroup v2 (unified hierarchy) required; {} not found",
                root.join(UNIFIED_MARKER).display()
            ),
        }
    }
}

static HOST_CAPABILITY: OnceCell<(PathBuf, Capability)> = OnceCell::new();

/// Probe the host once per process. Later calls return the first answer;
/// a different root than the first one probed is checked directly.
pub fn host_capability(root: &Path) -> Capability {
    let (probed_root, capability) = HOST_CAPABILITY.get_or_init(|| {
        let capability = detect_unified_hierarchy(root);
        match &capability {
            Capability::Supported => log::info!("Unified cgroup hierarchy detected at {}", root.display()),
            Capability::Unsupported { reason } => log::error!("{}", reason),
        }
        (root.to_path_buf(), capability)
    });

    if probed_root == root {
        capability.clone()
    } else {
        detect_unified_hierarchy(root)
    }
}
