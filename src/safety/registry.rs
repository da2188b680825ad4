//! Process-wide registry of live sandbox handles.
//!
//! A group path is reserved before the backend creates it, promoted to a
//! live entry once the child runs, and removed by that handle's cleanup.
//! On host shutdown every live entry is stopped and cleaned exactly once,
//! so no resource group outlives the supervisor process.

use crate::config::types::{Result, SandboxError};
use crate::core::handle::HandleInner;
use crate::observability::audit::events;
use crate::safety::cleanup;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

enum Slot {
    Reserved,
    Live(Arc<HandleInner>),
}

#[derive(Default)]
pub struct HandleRegistry {
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

static GLOBAL: Lazy<Arc<HandleRegistry>> = Lazy::new(|| Arc::new(HandleRegistry::new()));

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every supervisor that was not given its own.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `path` unless it is reserved or live.
    pub(crate) fn try_reserve(self: &Arc<Self>, path: &Path) -> Option<GroupReservation> {
        let mut slots = self.slots();
        if slots.contains_key(path) {
            return None;
        }
        slots.insert(path.to_path_buf(), Slot::Reserved);
        Some(GroupReservation {
            registry: Arc::clone(self),
            path: path.to_path_buf(),
            armed: true,
        })
    }

    pub(crate) fn deregister(&self, path: &Path) {
        if self.slots().remove(path).is_none() {
            debug!("Group {} was not registered", path.display());
        }
    }

    /// Handles launched and not yet cleaned up.
    pub fn live_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Reserved or live.
    pub fn contains(&self, path: &Path) -> bool {
        self.slots().contains_key(path)
    }

    pub fn live_groups(&self) -> Vec<PathBuf> {
        self.slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn live_handles(&self) -> Vec<Arc<HandleInner>> {
        self.slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(inner) => Some(Arc::clone(inner)),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Stop every live handle and wait up to `grace` for their cleanups.
    /// Handles still pending at the deadline are cleaned up forcibly and
    /// reported in [`SandboxError::ShutdownGraceExceeded`]. Returns the
    /// number of handles processed.
    pub async fn shutdown_all(&self, grace: Duration) -> Result<usize> {
        let handles = self.live_handles();
        info!("Shutting down {} live sandbox(es)", handles.len());
        events::shutdown_hook_fired(handles.len());

        for inner in &handles {
            inner.stop();
        }

        let deadline = Instant::now() + grace;
        let mut pending = Vec::new();
        for inner in &handles {
            match tokio::time::timeout_at(deadline, inner.cleaned.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Cleanup of {} failed during shutdown: {}", inner.group().display(), e),
                Err(_) => pending.push(Arc::clone(inner)),
            }
        }

        if pending.is_empty() {
            return Ok(handles.len());
        }

        let mut groups = Vec::with_capacity(pending.len());
        for inner in &pending {
            warn!("Forcing cleanup of {} after shutdown grace", inner.group().display());
            cleanup::cleanup(inner);
            groups.push(inner.group().to_path_buf());
        }
        Err(SandboxError::ShutdownGraceExceeded {
            grace,
            pending: groups,
        })
    }
}

/// A reserved group path. Dropping it without [`activate`](Self::activate)
/// returns the path to the pool.
pub(crate) struct GroupReservation {
    registry: Arc<HandleRegistry>,
    path: PathBuf,
    armed: bool,
}

impl GroupReservation {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Promote the reservation to a live handle.
    pub(crate) fn activate(mut self, inner: Arc<HandleInner>) {
        self.registry
            .slots()
            .insert(self.path.clone(), Slot::Live(inner));
        self.armed = false;
    }
}

impl Drop for GroupReservation {
    fn drop(&mut self) {
        if self.armed {
            debug!("Releasing unused reservation {}", self.path.display());
            self.registry.slots().remove(&self.path);
        }
    }
}
