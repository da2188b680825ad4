/// Cleanup coordinator
/// Exactly-once teardown of a handle: stop the polling timer, leave the
/// live-handle registry, release the resource group. Safe to request from
/// every exit path; only the first request performs the side effects.
use crate::config::types::SandboxError;
use crate::core::handle::HandleInner;
use crate::observability::audit::events;
use log::{debug, error};
use std::sync::Arc;

/// Tear the handle down. Returns `true` for the one call that did the work.
///
/// The group release runs on the handle's runtime; its result resolves the
/// cleanup channel and never touches the outcome channel.
pub(crate) fn cleanup(inner: &Arc<HandleInner>) -> bool {
    {
        let mut state = inner.lock_state();
        if !state.running {
            debug!("Cleanup of {} already done", inner.group().display());
            return false;
        }
        state.running = false;
    }

    inner.poll_cancel.cancel();
    inner.registry.deregister(inner.group());
    inner.metrics.live_sandboxes.dec();

    let inner = Arc::clone(inner);
    let runtime = inner.runtime.clone();
    runtime.spawn(async move {
        let released = inner.backend.release_group(inner.group()).await;
        match released {
            Ok(()) => {
                debug!("Released group {}", inner.group().display());
                events::cleanup_succeeded(inner.group());
                inner.metrics.cleanup_success_total.inc();
                inner.cleaned.resolve(Ok(()));
            }
            Err(e) => {
                let e = match e {
                    SandboxError::Cleanup(_) => e,
                    other => SandboxError::Cleanup(other.to_string()),
                };
                error!("Failed to release group {}: {}", inner.group().display(), e);
                events::cleanup_failed(inner.group(), &e);
                inner.metrics.cleanup_failure_total.inc();
                inner.cleaned.resolve(Err(e));
            }
        }
    });

    true
}
