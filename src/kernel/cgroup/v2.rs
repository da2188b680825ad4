/// Cgroup v2 isolation backend
/// Starts the child inside its own group of the unified hierarchy and
/// exposes that group's counter files.
use crate::config::settings::SupervisorConfig;
use crate::config::types::{Result, SandboxError, SandboxParameter, TerminationCause};
use crate::kernel::cgroup::backend::{host_capability, Capability, IsolationBackend};
use crate::kernel::signal;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};

const RELEASE_ATTEMPTS: u32 = 5;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Cgroup v2 backend
pub struct CgroupV2Backend {
    root: PathBuf,
    memory_headroom: u64,
    children: Mutex<HashMap<u32, Child>>,
}

impl CgroupV2Backend {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            root: config.cgroup_root.clone(),
            memory_headroom: config.memory_limit_headroom_bytes,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Absolute path of a group
    pub fn group_path(&self, group: &Path) -> PathBuf {
        self.root.join(group)
    }

    /// Children started here whose exit has not been observed yet.
    fn owned_children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delegate cpu and memory to children of `parent`. Best effort: the
    /// controllers may already be enabled, or be managed by the host.
    fn enable_controllers(&self, parent: &Path) {
        let control = parent.join("cgroup.subtree_control");
        if let Err(e) = fs::write(&control, "+cpu +memory") {
            debug!(
                "Could not enable controllers on {}: {}",
                control.display(),
                e
            );
        }
    }

    fn create_group(&self, parameter: &SandboxParameter) -> Result<PathBuf> {
        let path = self.group_path(&parameter.cgroup);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Launch(format!(
                    "Failed to create parent cgroup {}: {}",
                    parent.display(),
                    e
                ))
            })?;
            self.enable_controllers(parent);
        }

        fs::create_dir(&path).map_err(|e| {
            SandboxError::Launch(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        remove_group_on_error(&path, || self.configure_group(&path, parameter))?;
        Ok(path)
    }

    /// Apply limits to a freshly created group.
    fn configure_group(&self, path: &Path, parameter: &SandboxParameter) -> Result<()> {
        if let Some(limit) = parameter.memory_limit_bytes {
            let max = limit.saturating_add(self.memory_headroom);
            fs::write(path.join("memory.max"), max.to_string()).map_err(|e| {
                SandboxError::Launch(format!(
                    "Failed to set memory.max on {} (memory controller delegated?): {}",
                    path.display(),
                    e
                ))
            })?;

            // Swap accounting is optional in the kernel config.
            let swap_max = path.join("memory.swap.max");
            if swap_max.exists() {
                if let Err(e) = fs::write(&swap_max, "0") {
                    warn!("Failed to disable swap for {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    fn build_command(&self, parameter: &SandboxParameter, procs: CString) -> Result<Command> {
        let mut cmd = Command::new(&parameter.executable);
        cmd.args(&parameter.arguments)
            .env_clear()
            .envs(parameter.environment.iter().map(|(k, v)| (k, v)))
            .stdin(open_input(parameter.stdin.as_deref())?)
            .stdout(open_output(parameter.stdout.as_deref())?)
            .stderr(open_output(parameter.stderr.as_deref())?);

        if let Some(dir) = &parameter.working_directory {
            cmd.current_dir(dir);
        }

        // SAFETY: join_cgroup only uses async-signal-safe libc calls and
        // borrows a CString allocated before fork.
        unsafe {
            cmd.pre_exec(move || join_cgroup(&procs));
        }

        Ok(cmd)
    }
}

/// Run `setup` on a group this launch created; on failure remove the group
/// again, since no handle will ever own it.
fn remove_group_on_error<T>(path: &Path, setup: impl FnOnce() -> Result<T>) -> Result<T> {
    let result = setup();
    if result.is_err() {
        // No process ever joined the group, so rmdir cannot be EBUSY.
        if let Err(rm) = fs::remove_dir(path) {
            warn!(
                "Failed to remove cgroup {} after launch failure: {}",
                path.display(),
                rm
            );
        }
    }
    result
}

/// Block until `pid` has exited, leaving it a zombie. The pid cannot be
/// reused until the zombie is reaped.
fn wait_for_exit_without_reaping(pid: u32) -> std::io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Move the calling process into the group whose `cgroup.procs` is `procs`.
/// Runs between fork and exec: no allocation, no locks.
fn join_cgroup(procs: &CStr) -> std::io::Result<()> {
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let written = unsafe { libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) };
    let result = if written < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    };

    unsafe {
        libc::close(fd);
    }
    result
}

fn open_input(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => fs::File::open(path).map(Stdio::from).map_err(|e| {
            SandboxError::Launch(format!("Failed to open stdin {}: {}", path.display(), e))
        }),
        None => Ok(Stdio::null()),
    }
}

fn open_output(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => fs::File::create(path).map(Stdio::from).map_err(|e| {
            SandboxError::Launch(format!("Failed to open output {}: {}", path.display(), e))
        }),
        None => Ok(Stdio::null()),
    }
}

/// Parse a single-value counter file. `max` and empty content are unavailable.
pub fn parse_single_value(content: &str) -> Result<Option<u64>> {
    let value = content.trim();
    if value.is_empty() || value == "max" {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|e| SandboxError::Cgroup(format!("Failed to parse counter '{}': {}", value, e)))
}

/// Parse one `key value` line of a flat-keyed file such as `cpu.stat`.
pub fn parse_keyed_value(content: &str, key: &str) -> Result<Option<u64>> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            return match parts.next() {
                Some(value) => parse_single_value(value),
                None => Ok(None),
            };
        }
    }
    Ok(None)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SandboxError::Cgroup(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl IsolationBackend for CgroupV2Backend {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn capability(&self) -> Capability {
        host_capability(&self.root)
    }

    async fn start(&self, parameter: &SandboxParameter) -> Result<u32> {
        let path = self.create_group(parameter)?;

        let child = remove_group_on_error(&path, || {
            let procs = CString::new(path.join("cgroup.procs").as_os_str().as_bytes())
                .map_err(|e| SandboxError::Launch(format!("Invalid cgroup path: {}", e)))?;
            let mut cmd = self.build_command(parameter, procs)?;
            cmd.spawn().map_err(|e| {
                SandboxError::Launch(format!(
                    "Failed to spawn {}: {}",
                    parameter.executable.display(),
                    e
                ))
            })
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Launch("child exited before reporting a pid".to_string()))?;

        self.owned_children().insert(pid, child);

        debug!("Started pid {} in {}", pid, path.display());
        Ok(pid)
    }

    async fn await_termination(&self, pid: u32) -> Result<TerminationCause> {
        if !self.owned_children().contains_key(&pid) {
            return Err(SandboxError::Wait(format!("no child with pid {} to wait for", pid)));
        }

        // Observe the exit while the pid is still a zombie, then retire it
        // under the lock `kill` takes, so `kill` never reaches a reused pid.
        match tokio::task::spawn_blocking(move || wait_for_exit_without_reaping(pid)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("waitid({}) failed, reaping directly: {}", pid, e),
            Err(e) => warn!("exit watcher for pid {} aborted, reaping directly: {}", pid, e),
        }

        let mut child = self
            .owned_children()
            .remove(&pid)
            .ok_or_else(|| SandboxError::Wait(format!("pid {} waited on twice", pid)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| SandboxError::Wait(format!("wait({}) failed: {}", pid, e)))?;

        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => TerminationCause::Exited(code),
            (None, Some(signal)) => TerminationCause::Signaled(signal),
            (None, None) => TerminationCause::Unrecognized,
        })
    }

    fn read_counter(&self, group: &Path, key: &str) -> Result<Option<u64>> {
        match read_optional(&self.group_path(group).join(key))? {
            Some(content) => parse_single_value(&content),
            None => Ok(None),
        }
    }

    fn read_nested_counter(&self, group: &Path, file: &str, key: &str) -> Result<Option<u64>> {
        match read_optional(&self.group_path(group).join(file))? {
            Some(content) => parse_keyed_value(&content, key),
            None => Ok(None),
        }
    }

    /// Only pids still owned by this backend are signalled. The lock is held
    /// across the kill, and a pid leaves the map only while it is a zombie.
    fn kill(&self, pid: u32) -> Result<()> {
        let children = self.owned_children();
        if !children.contains_key(&pid) {
            debug!("Not signalling pid {}: no longer owned", pid);
            return Ok(());
        }
        signal::kill_process(pid)
    }

    async fn release_group(&self, group: &Path) -> Result<()> {
        let path = self.group_path(group);

        for attempt in 1..=RELEASE_ATTEMPTS {
            match tokio::fs::remove_dir(&path).await {
                Ok(()) => {
                    debug!("Removed cgroup {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < RELEASE_ATTEMPTS => {
                    // Stray descendants keep the group alive; cgroup.kill (5.14+) reaps them.
                    debug!(
                        "Cgroup {} busy (attempt {}), killing leftovers",
                        path.display(),
                        attempt
                    );
                    if let Err(e) = tokio::fs::write(path.join("cgroup.kill"), "1").await {
                        debug!("Could not write cgroup.kill for {}: {}", path.display(), e);
                    }
                    tokio::time::sleep(RELEASE_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(SandboxError::Cleanup(format!(
                        "Failed to remove cgroup {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(SandboxError::Cleanup(format!(
            "Cgroup {} still busy after {} attempts",
            path.display(),
            RELEASE_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_at(root: &Path) -> CgroupV2Backend {
        let mut config = SupervisorConfig::default();
        config.cgroup_root = root.to_path_buf();
        CgroupV2Backend::new(&config)
    }

    #[test]
    fn test_group_path() {
        let backend = backend_at(Path::new("/sys/fs/cgroup"));
        assert_eq!(
            backend.group_path(Path::new("judge/abc")),
            PathBuf::from("/sys/fs/cgroup/judge/abc")
        );
    }

    #[test]
    fn test_parse_single_value() {
        assert_eq!(parse_single_value("4096\n").unwrap(), Some(4096));
        assert_eq!(parse_single_value("max\n").unwrap(), None);
        assert_eq!(parse_single_value("").unwrap(), None);
        assert!(parse_single_value("NaN").is_err());
    }

    #[test]
    fn test_parse_keyed_value() {
        let stat = "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n";
        assert_eq!(parse_keyed_value(stat, "usage_usec").unwrap(), Some(1500));
        assert_eq!(parse_keyed_value(stat, "system_usec").unwrap(), Some(500));
        assert_eq!(parse_keyed_value(stat, "nr_periods").unwrap(), None);
    }

    #[test]
    fn test_read_counters_from_group_files() {
        let root = tempfile::tempdir().unwrap();
        let group = Path::new("judge/run1");
        let dir = root.path().join(group);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("memory.peak"), "8192\n").unwrap();
        fs::write(dir.join("cpu.stat"), "usage_usec 250\nuser_usec 200\n").unwrap();

        let backend = backend_at(root.path());
        assert_eq!(backend.read_counter(group, "memory.peak").unwrap(), Some(8192));
        assert_eq!(backend.read_counter(group, "memory.current").unwrap(), None);
        assert_eq!(
            backend
                .read_nested_counter(group, "cpu.stat", "usage_usec")
                .unwrap(),
            Some(250)
        );
    }

    #[tokio::test]
    async fn test_release_group_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let group = Path::new("judge/run2");
        fs::create_dir_all(root.path().join(group)).unwrap();

        let backend = backend_at(root.path());
        backend.release_group(group).await.unwrap();
        assert!(!root.path().join(group).exists());
        backend.release_group(group).await.unwrap();
    }

    #[tokio::test]
    async fn test_await_unknown_pid_is_wait_error() {
        let backend = backend_at(Path::new("/sys/fs/cgroup"));
        let err = backend.await_termination(999_999).await.unwrap_err();
        assert_eq!(err.as_label(), "wait_error");
    }

    /// Relative group whose absolute path under `root` is exactly `target` bytes.
    fn group_with_absolute_len(root: &Path, target: usize) -> PathBuf {
        let mut remaining = target - root.as_os_str().len() - 1;
        let mut group = PathBuf::new();
        while remaining > 200 {
            group.push("c".repeat(199));
            remaining -= 200;
        }
        group.push("g".repeat(remaining));
        group
    }

    #[test]
    fn test_memory_limit_written_with_headroom() {
        let root = tempfile::tempdir().unwrap();
        let backend = backend_at(root.path());
        let parameter = SandboxParameter::new("judge/limits", "/bin/true").with_memory_limit(4096);

        let path = backend.create_group(&parameter).unwrap();
        let written = fs::read_to_string(path.join("memory.max")).unwrap();
        assert_eq!(written, (4096 + 1024 * 1024).to_string());
    }

    #[test]
    fn test_failed_memory_limit_removes_new_group() {
        let root = tempfile::tempdir().unwrap();
        // The group directory fits in PATH_MAX, its memory.max does not.
        let group = group_with_absolute_len(root.path(), 4090);
        assert_eq!(root.path().join(&group).as_os_str().len(), 4090);

        let backend = backend_at(root.path());
        let parameter = SandboxParameter::new(group.clone(), "/bin/true").with_memory_limit(4096);

        let err = backend.create_group(&parameter).unwrap_err();
        assert_eq!(err.as_label(), "launch_error");
        assert!(err.to_string().contains("memory.max"));
        assert!(!root.path().join(&group).exists());
        assert!(root.path().join(&group).parent().unwrap().exists());
    }

    #[test]
    fn test_setup_failure_removes_group() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("judge-run");
        fs::create_dir(&dir).unwrap();

        let result: Result<()> = remove_group_on_error(&dir, || {
            Err(SandboxError::Launch("spawn failed".to_string()))
        });
        assert!(result.is_err());
        assert!(!dir.exists());

        fs::create_dir(&dir).unwrap();
        assert_eq!(remove_group_on_error(&dir, || Ok(7)).unwrap(), 7);
        assert!(dir.exists());
    }

    #[test]
    fn test_exit_observed_without_reaping() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        wait_for_exit_without_reaping(child.id()).unwrap();
        // Still a zombie owned by us: the status is collectable exactly once.
        let status = child.try_wait().unwrap().expect("exited child must be reapable");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_kill_ignores_pids_it_does_not_own() {
        let backend = backend_at(Path::new("/sys/fs/cgroup"));
        let mut stranger = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = stranger.id().unwrap();

        backend.kill(pid).unwrap();
        assert!(stranger.try_wait().unwrap().is_none());

        stranger.kill().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a delegated cgroup v2 subtree"]
    async fn test_start_and_wait_in_real_cgroup() {
        let backend = backend_at(Path::new("/sys/fs/cgroup"));
        let parameter = SandboxParameter::new("cgsupervisor-test/real", "/bin/true");
        let pid = backend.start(&parameter).await.unwrap();
        let cause = backend.await_termination(pid).await.unwrap();
        assert_eq!(cause, TerminationCause::Exited(0));
        assert!(backend
            .read_nested_counter(&parameter.cgroup, "cpu.stat", "usage_usec")
            .unwrap()
            .is_some());
        backend.release_group(&parameter.cgroup).await.unwrap();
    }
}
