/// Signal delivery and host shutdown handling
use crate::config::types::{Result, SandboxError};
use crate::safety::registry::HandleRegistry;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Send SIGKILL to `pid`.
/// A process that no longer exists is not an error: the goal is already met.
pub fn kill_process(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| SandboxError::Process(format!("pid out of range: {}", pid)))?;
    if raw <= 0 {
        // kill(0) / kill(-1) would target our own group or every process.
        return Err(SandboxError::Process(format!("refusing to signal pid {}", raw)));
    }

    match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("Process {} already gone", pid);
            Ok(())
        }
        Err(e) => Err(SandboxError::Process(format!(
            "Failed to kill process {}: {}",
            pid, e
        ))),
    }
}

/// Completes when the host receives SIGINT, SIGTERM or SIGQUIT.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigquit.recv() => info!("SIGQUIT received"),
    }
    Ok(())
}

/// Spawn the host-exit hook: on a shutdown signal, stop and clean up every
/// live handle in `registry`. Must be called from within a tokio runtime.
pub fn install_shutdown_hook(registry: Arc<HandleRegistry>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("Failed to install shutdown signal listeners: {}", e);
            return;
        }

        match registry.shutdown_all(grace).await {
            Ok(count) => info!("Shutdown hook released {} sandbox(es)", count),
            Err(e) => warn!("Shutdown hook incomplete: {}", e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_refuses_special_pids() {
        assert!(kill_process(0).is_err());
        assert!(kill_process(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        kill_process(pid).unwrap();
        let status = child.wait().await.unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
