//! Scripted fakes for service-level tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use crate::domain::deploy::LogLine;
use crate::domain::{HealthStatus, Revision, StopOutcome};
use crate::error::DeployError;
use crate::services::fetcher::ArtifactFetcher;
use crate::services::source::RevisionSource;
use crate::services::supervisor::ServiceControl;

/// Revision source answering from a script; the last entry repeats.
pub struct FakeSource {
    answers: Mutex<VecDeque<Result<String, String>>>,
    pub calls: AtomicU32,
    delay: Duration,
}

impl FakeSource {
    pub fn new(answers: Vec<Result<&str, &str>>) -> Self {
        Self {
            answers: Mutex::new(
                answers
                    .into_iter()
                    .map(|a| a.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn fixed(revision: &str) -> Self {
        Self::new(vec![Ok(revision)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set(&self, answer: Result<&str, &str>) {
        let mut answers = self.answers.lock().unwrap();
        answers.clear();
        answers.push_back(answer.map(str::to_string).map_err(str::to_string));
    }
}

#[async_trait]
impl RevisionSource for FakeSource {
    async fn latest(&self) -> Result<String, DeployError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let answer = {
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap()
            }
        };
        answer.map_err(DeployError::SourceUnreachable)
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Fetcher that knows a fixed set of revisions and writes a `REVISION` file.
pub struct FakeFetcher {
    known: HashSet<String>,
    /// When set, `materialize` signals `entered` and blocks until `release` fires.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeFetcher {
    pub fn new(known: &[&str]) -> Self {
        Self {
            known: known.iter().map(|s| s.to_string()).collect(),
            gate: None,
        }
    }

    /// Returns (entered, release).
    pub fn gated(mut self) -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.gate = Some((entered.clone(), release.clone()));
        (self, entered, release)
    }

}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn validate(&self, revision: &Revision) -> Result<Revision, DeployError> {
        if self.known.contains(revision.id()) {
            Ok(revision.clone())
        } else {
            Err(DeployError::RevisionUnavailable(
                revision.id().to_string(),
                "unknown revision".to_string(),
            ))
        }
    }

    async fn materialize(
        &self,
        revision: &Revision,
        dest: &Path,
        _log_tx: Option<broadcast::Sender<LogLine>>,
    ) -> Result<(), DeployError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("REVISION"), revision.id()).await?;
        Ok(())
    }
}

/// Service whose health depends on which revision is running.
#[derive(Default)]
pub struct FakeService {
    healthy: Mutex<HashSet<String>>,
    running: Mutex<Option<String>>,
    pid_seq: AtomicU32,
    pub events: Mutex<Vec<String>>,
    pub probes: AtomicU32,
    /// `stop` reports a forced kill.
    pub stubborn: Mutex<bool>,
    pub force_kills: AtomicU32,
    adoptable: Mutex<Option<(String, u32)>>,
}

impl FakeService {
    pub fn new(healthy: &[&str]) -> Self {
        Self {
            healthy: Mutex::new(healthy.iter().map(|s| s.to_string()).collect()),
            pid_seq: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    /// A service already running `revision` from an earlier agent.
    pub fn with_running(self, revision: &str, pid: u32) -> Self {
        *self.adoptable.lock().unwrap() = Some((revision.to_string(), pid));
        self
    }

    pub fn set_healthy(&self, healthy: &[&str]) {
        *self.healthy.lock().unwrap() = healthy.iter().map(|s| s.to_string()).collect();
    }

    pub fn running(&self) -> Option<String> {
        self.running.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ServiceControl for FakeService {
    async fn start(&self, revision: &Revision, work_dir: &Path) -> Result<u32, DeployError> {
        let on_disk = tokio::fs::read_to_string(work_dir.join("REVISION"))
            .await
            .unwrap_or_default();
        if on_disk != revision.id() {
            return Err(DeployError::StartFailure(format!(
                "work dir holds '{}', expected '{}'",
                on_disk,
                revision.id()
            )));
        }
        self.push(format!("start:{}", revision.id()));
        *self.running.lock().unwrap() = Some(revision.id().to_string());
        Ok(self.pid_seq.fetch_add(1, Ordering::SeqCst))
    }

    async fn stop(&self, _timeout: Duration) -> Result<StopOutcome, DeployError> {
        let was = self.running.lock().unwrap().take();
        let Some(revision) = was else {
            self.push("stop:none".to_string());
            return Ok(StopOutcome::NotRunning);
        };
        self.push(format!("stop:{}", revision));
        if *self.stubborn.lock().unwrap() {
            self.force_kills.fetch_add(1, Ordering::SeqCst);
            return Ok(StopOutcome::Forced);
        }
        Ok(StopOutcome::Graceful)
    }

    async fn health_check(&self) -> HealthStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let running = self.running.lock().unwrap().clone();
        match running {
            Some(rev) if self.healthy.lock().unwrap().contains(&rev) => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy,
        }
    }

    async fn force_kill(&self) -> Result<(), DeployError> {
        self.force_kills.fetch_add(1, Ordering::SeqCst);
        *self.running.lock().unwrap() = None;
        Ok(())
    }

    async fn pid(&self) -> Option<u32> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|_| self.pid_seq.load(Ordering::SeqCst) - 1)
    }

    async fn adopt(&self) -> Option<u32> {
        let (revision, pid) = self.adoptable.lock().unwrap().take()?;
        self.push(format!("adopt:{}", revision));
        *self.running.lock().unwrap() = Some(revision);
        Some(pid)
    }
}
