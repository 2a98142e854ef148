//! Service process supervisor.
//!
//! Runs the deployed service as `sh -c <start_command>` in its own process
//! group so that stop signals reach every process the start script spawned.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, RwLock},
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::config::service::{HealthProbe, ServiceConfig};
use crate::domain::{HealthStatus, Revision, StopOutcome};
use crate::error::DeployError;
use crate::infra::command::CommandRunner;

const MAX_LOG_LINES: usize = 2000;
/// How long to wait for the process to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle control of the deployed service.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Start the service for `revision` from `work_dir`, returning its pid.
    async fn start(&self, revision: &Revision, work_dir: &Path) -> Result<u32, DeployError>;

    /// Graceful stop with escalation to `force_kill` once `timeout` expires.
    async fn stop(&self, timeout: Duration) -> Result<StopOutcome, DeployError>;

    /// One bounded health probe.
    async fn health_check(&self) -> HealthStatus;

    async fn force_kill(&self) -> Result<(), DeployError>;

    async fn pid(&self) -> Option<u32>;

    /// Take over a service left running by a previous agent process.
    async fn adopt(&self) -> Option<u32> {
        None
    }
}

enum Managed {
    /// Spawned by this supervisor.
    Child { child: Child, pid: u32 },
    /// Found through the pid file.
    Adopted { pid: u32 },
}

impl Managed {
    fn pid(&self) -> u32 {
        match self {
            Managed::Child { pid, .. } | Managed::Adopted { pid } => *pid,
        }
    }

    fn is_alive(&mut self) -> bool {
        match self {
            Managed::Child { child, .. } => matches!(child.try_wait(), Ok(None)),
            Managed::Adopted { pid } => pid_alive(*pid),
        }
    }

    /// Wait for exit, up to `timeout`. Returns whether the process exited.
    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        match self {
            Managed::Child { child, .. } => tokio::time::timeout(timeout, child.wait()).await.is_ok(),
            Managed::Adopted { pid } => {
                let deadline = Instant::now() + timeout;
                while pid_alive(*pid) {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    sleep(POLL_INTERVAL).await;
                }
                true
            }
        }
    }
}

/// Supervises the deployed service process.
pub struct ProcessSupervisor {
    config: ServiceConfig,
    pid_file: PathBuf,
    managed: Mutex<Option<Managed>>,
    work_dir: RwLock<Option<PathBuf>>,
    force_kills: AtomicU32,
    http: reqwest::Client,
    log_lines: Arc<RwLock<VecDeque<String>>>,
}

impl ProcessSupervisor {
    pub fn new(config: ServiceConfig, pid_file: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .expect("Failed to build reqwest client");

        Self {
            config,
            pid_file: pid_file.into(),
            managed: Mutex::new(None),
            work_dir: RwLock::new(None),
            force_kills: AtomicU32::new(0),
            http,
            log_lines: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Number of SIGKILL escalations since the supervisor was created.
    pub fn force_kill_count(&self) -> u32 {
        self.force_kills.load(Ordering::Relaxed)
    }

    pub async fn tail_logs(&self, tail: usize) -> Vec<String> {
        let tail = tail.clamp(1, MAX_LOG_LINES);
        let lines = self.log_lines.read().await;
        let start = lines.len().saturating_sub(tail);
        lines.iter().skip(start).cloned().collect()
    }

    async fn push_log_line(&self, line: String) {
        push_line(&self.log_lines, line).await;
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.managed.lock().await;
        let Some(managed) = guard.as_mut() else {
            return false;
        };
        if managed.is_alive() {
            return true;
        }

        let pid = managed.pid();
        *guard = None;
        drop(guard);
        self.push_log_line(format!("[supervisor] service (pid {}) exited", pid))
            .await;
        false
    }

    async fn write_pid_file(&self, pid: u32) {
        if let Some(parent) = self.pid_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.pid_file, pid.to_string()).await {
            warn!(path = %self.pid_file.display(), error = %e, "Failed to write pid file");
        }
    }

    async fn remove_pid_file(&self) {
        match tokio::fs::remove_file(&self.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.pid_file.display(), error = %e, "Failed to remove pid file"),
        }
    }

    fn spawn_reader<R>(&self, reader: R, stream: &'static str)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let log_lines = self.log_lines.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                push_line(&log_lines, format!("[{}] {}", stream, line)).await;
            }
        });
    }

    async fn probe(&self) -> HealthStatus {
        match &self.config.health {
            HealthProbe::Process => HealthStatus::Healthy,
            HealthProbe::Http { url } => match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), "Health probe returned non-success");
                    HealthStatus::Unhealthy
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Health probe request failed");
                    HealthStatus::Unhealthy
                }
            },
            HealthProbe::Command { command } => {
                let work_dir = self
                    .work_dir
                    .read()
                    .await
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                match CommandRunner::run_shell_with_streaming(
                    command,
                    &work_dir,
                    &[],
                    None,
                    self.config.probe_timeout,
                )
                .await
                {
                    Ok(result) if result.success() => HealthStatus::Healthy,
                    Ok(result) => {
                        debug!(code = result.code(), "Health command failed");
                        HealthStatus::Unhealthy
                    }
                    Err(e) => {
                        debug!(error = %e, "Health command did not complete");
                        HealthStatus::Unhealthy
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ServiceControl for ProcessSupervisor {
    async fn start(&self, revision: &Revision, work_dir: &Path) -> Result<u32, DeployError> {
        if self.is_running().await {
            return Err(DeployError::StartFailure(
                "a service process is already running".to_string(),
            ));
        }

        let mut guard = self.managed.lock().await;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.start_command)
            .current_dir(work_dir)
            .env("EEVEON_REVISION", revision.id())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        self.push_log_line(format!(
            "[supervisor] starting {} at {}: {}",
            revision.short(),
            work_dir.display(),
            self.config.start_command
        ))
        .await;

        let mut child = cmd
            .spawn()
            .map_err(|e| DeployError::StartFailure(format!("failed to spawn service: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| DeployError::StartFailure("service exited immediately".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr, "stderr");
        }

        *guard = Some(Managed::Child { child, pid });
        drop(guard);

        *self.work_dir.write().await = Some(work_dir.to_path_buf());
        self.write_pid_file(pid).await;

        info!(pid, revision = %revision, "Service started");
        Ok(pid)
    }

    async fn stop(&self, timeout: Duration) -> Result<StopOutcome, DeployError> {
        let mut guard = self.managed.lock().await;
        let Some(mut managed) = guard.take() else {
            drop(guard);
            self.remove_pid_file().await;
            return Ok(StopOutcome::NotRunning);
        };

        let pid = managed.pid();
        if !managed.is_alive() {
            drop(guard);
            self.remove_pid_file().await;
            return Ok(StopOutcome::NotRunning);
        }

        info!(pid, "Stopping service");
        signal_group(pid, Signal::Term);

        if managed.wait_exit(timeout).await {
            drop(guard);
            self.remove_pid_file().await;
            self.push_log_line(format!("[supervisor] service (pid {}) stopped", pid))
                .await;
            return Ok(StopOutcome::Graceful);
        }

        warn!(pid, "Service did not stop within {:?}, killing", timeout);
        *guard = Some(managed);
        drop(guard);

        self.force_kill()
            .await
            .map_err(|_| DeployError::StopTimeout(timeout + KILL_GRACE))?;
        Ok(StopOutcome::Forced)
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.is_running().await {
            return HealthStatus::Unhealthy;
        }
        // The http client and command runner enforce the probe timeout themselves;
        // this bound covers everything else.
        tokio::time::timeout(self.config.probe_timeout + Duration::from_secs(1), self.probe())
            .await
            .unwrap_or(HealthStatus::Unhealthy)
    }

    async fn force_kill(&self) -> Result<(), DeployError> {
        let mut guard = self.managed.lock().await;
        let Some(mut managed) = guard.take() else {
            return Ok(());
        };
        let pid = managed.pid();

        self.force_kills.fetch_add(1, Ordering::Relaxed);
        signal_group(pid, Signal::Kill);

        if !managed.wait_exit(KILL_GRACE).await {
            // still alive, keep it managed
            *guard = Some(managed);
            return Err(DeployError::StopTimeout(KILL_GRACE));
        }
        drop(guard);
        self.remove_pid_file().await;
        self.push_log_line(format!("[supervisor] service (pid {}) killed", pid))
            .await;
        Ok(())
    }

    async fn pid(&self) -> Option<u32> {
        let mut guard = self.managed.lock().await;
        let managed = guard.as_mut()?;
        managed.is_alive().then(|| managed.pid())
    }

    async fn adopt(&self) -> Option<u32> {
        let raw = tokio::fs::read_to_string(&self.pid_file).await.ok()?;
        let pid = match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 1 => pid,
            _ => {
                warn!(path = %self.pid_file.display(), "Ignoring malformed pid file");
                self.remove_pid_file().await;
                return None;
            }
        };

        if !pid_alive(pid) {
            debug!(pid, "Stale pid file, service is not running");
            self.remove_pid_file().await;
            return None;
        }

        let mut guard = self.managed.lock().await;
        if guard.is_some() {
            return None;
        }
        *guard = Some(Managed::Adopted { pid });
        drop(guard);

        self.push_log_line(format!("[supervisor] adopted running service (pid {})", pid))
            .await;
        info!(pid, "Adopted running service");
        Some(pid)
    }
}

async fn push_line(log_lines: &RwLock<VecDeque<String>>, line: String) {
    let mut lines = log_lines.write().await;
    lines.push_back(line);
    while lines.len() > MAX_LOG_LINES {
        lines.pop_front();
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`, falling back to the single process.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    use nix::sys::signal::{kill, killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pid, sig) {
        debug!(pid = %pid, error = %e, "killpg failed, signalling process");
        if let Err(e) = kill(pid, sig) {
            debug!(pid = %pid, error = %e, "kill failed");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: Signal) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(start_command: &str, health: HealthProbe) -> ServiceConfig {
        ServiceConfig {
            start_command: start_command.to_string(),
            health,
            stop_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            start_on_boot: false,
        }
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("service.pid");
        let supervisor = ProcessSupervisor::new(
            config("echo started-$EEVEON_REVISION; exec sleep 30", HealthProbe::Process),
            &pid_file,
        );

        let pid = supervisor
            .start(&Revision::new("abc"), dir.path())
            .await
            .unwrap();
        assert_eq!(supervisor.pid().await, Some(pid));
        assert_eq!(
            std::fs::read_to_string(&pid_file).unwrap(),
            pid.to_string()
        );
        assert_eq!(supervisor.health_check().await, HealthStatus::Healthy);

        let outcome = supervisor.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(supervisor.force_kill_count(), 0);
        assert!(!pid_file.exists());
        assert_eq!(supervisor.pid().await, None);
        assert!(supervisor
            .tail_logs(10)
            .await
            .iter()
            .any(|l| l.contains("started-abc")));
    }

    #[tokio::test]
    async fn test_stop_timeout_force_kills_once() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(
            config("trap '' TERM; sleep 30", HealthProbe::Process),
            dir.path().join("service.pid"),
        );

        supervisor
            .start(&Revision::new("abc"), dir.path())
            .await
            .unwrap();
        // let the shell install its trap
        sleep(Duration::from_millis(200)).await;

        let outcome = supervisor.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(supervisor.force_kill_count(), 1);
        assert!(!supervisor.is_running().await);
        assert!(!dir.path().join("service.pid").exists());
        assert!(supervisor
            .tail_logs(10)
            .await
            .iter()
            .any(|line| line.contains("killed")));

        assert_eq!(
            supervisor.stop(Duration::from_millis(300)).await.unwrap(),
            StopOutcome::NotRunning
        );
        assert_eq!(supervisor.force_kill_count(), 1);
    }

    #[tokio::test]
    async fn test_exited_service_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(
            config("exit 1", HealthProbe::Process),
            dir.path().join("service.pid"),
        );

        supervisor
            .start(&Revision::new("abc"), dir.path())
            .await
            .unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(supervisor.health_check().await, HealthStatus::Unhealthy);
        assert_eq!(
            supervisor.stop(Duration::from_secs(1)).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn test_command_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ready"), "").unwrap();

        let healthy = ProcessSupervisor::new(
            config(
                "exec sleep 30",
                HealthProbe::Command {
                    command: "test -f ready".to_string(),
                },
            ),
            dir.path().join("a.pid"),
        );
        healthy
            .start(&Revision::new("abc"), dir.path())
            .await
            .unwrap();
        assert_eq!(healthy.health_check().await, HealthStatus::Healthy);
        healthy.stop(Duration::from_secs(5)).await.unwrap();

        let unhealthy = ProcessSupervisor::new(
            config(
                "exec sleep 30",
                HealthProbe::Command {
                    command: "test -f missing".to_string(),
                },
            ),
            dir.path().join("b.pid"),
        );
        unhealthy
            .start(&Revision::new("abc"), dir.path())
            .await
            .unwrap();
        assert_eq!(unhealthy.health_check().await, HealthStatus::Unhealthy);
        unhealthy.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_adopt_from_pid_file() {
        use std::os::unix::process::CommandExt;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("service.pid");

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        std::fs::write(&pid_file, pid.to_string()).unwrap();
        // reap promptly, a zombie still answers kill(pid, 0)
        let reaper = std::thread::spawn(move || child.wait());

        let supervisor = ProcessSupervisor::new(config("true", HealthProbe::Process), &pid_file);
        assert_eq!(supervisor.adopt().await, Some(pid));
        assert_eq!(supervisor.pid().await, Some(pid));

        let outcome = supervisor.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!pid_file.exists());
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_adopt_ignores_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("service.pid");
        std::fs::write(&pid_file, "not-a-pid").unwrap();

        let supervisor = ProcessSupervisor::new(config("true", HealthProbe::Process), &pid_file);
        assert_eq!(supervisor.adopt().await, None);
        assert!(!pid_file.exists());
    }
}
