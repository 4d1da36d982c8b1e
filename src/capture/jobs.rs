//! Background capture jobs.
//!
//! A capture can wait minutes for a human to approve an MFA prompt, so each
//! one runs on its own tokio task, watched by a supervisor task. At most one
//! job runs per credential key; finished jobs stay visible to the status
//! endpoint until replaced.
//!
//! Only the supervisor publishes terminal states, after the job detail is
//! final. A panicking capture ends as FAILED.

use super::{CaptureEngine, CaptureProfile, CaptureReport, CaptureState};
use crate::config::LoginSecrets;
use crate::credentials::CredentialKey;
use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
struct JobDetail {
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    iterations: Option<u32>,
}

struct JobEntry {
    state: watch::Receiver<CaptureState>,
    started_at: DateTime<Utc>,
    detail: Arc<Mutex<JobDetail>>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        // State first: a terminal state implies the detail is already final
        let state = *self.state.borrow();
        let detail = self
            .detail
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default();
        JobSnapshot {
            state,
            started_at: self.started_at,
            finished_at: detail.finished_at,
            error: detail.error,
            iterations: detail.iterations,
        }
    }
}

/// Point-in-time view of a capture job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub state: CaptureState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub enum JobStart {
    Started(JobSnapshot),
    AlreadyRunning(JobSnapshot),
}

pub struct CaptureJobs {
    engine: Arc<CaptureEngine>,
    jobs: DashMap<CredentialKey, JobEntry>,
}

impl CaptureJobs {
    pub fn new(engine: Arc<CaptureEngine>) -> Self {
        Self {
            engine,
            jobs: DashMap::new(),
        }
    }

    /// Spawns a capture for `(profile.provider, account)` unless one is
    /// already in flight for that key.
    pub fn start(
        &self,
        profile: CaptureProfile,
        account: &str,
        login: Option<LoginSecrets>,
    ) -> JobStart {
        let key = CredentialKey::new(&profile.provider, account);

        let (tx, rx) = watch::channel(CaptureState::NotStarted);
        let detail = Arc::new(Mutex::new(JobDetail::default()));
        let entry = JobEntry {
            state: rx,
            started_at: Utc::now(),
            detail: Arc::clone(&detail),
        };

        let snapshot = match self.jobs.entry(key.clone()) {
            Entry::Occupied(existing) if !existing.get().state.borrow().is_terminal() => {
                return JobStart::AlreadyRunning(existing.get().snapshot());
            }
            Entry::Occupied(mut existing) => {
                existing.insert(entry);
                existing.get().snapshot()
            }
            Entry::Vacant(vacant) => vacant.insert(entry).snapshot(),
        };

        let engine = Arc::clone(&self.engine);
        let account = account.to_string();
        let (progress_tx, progress_rx) = watch::channel(CaptureState::NotStarted);
        let worker = tokio::spawn(async move {
            engine
                .capture(&profile, &account, login.as_ref(), &progress_tx)
                .await
        });
        tokio::spawn(supervise(key, worker, progress_rx, tx, detail));

        JobStart::Started(snapshot)
    }

    pub fn snapshot(&self, key: &CredentialKey) -> Option<JobSnapshot> {
        self.jobs.get(key).map(|entry| entry.snapshot())
    }

    pub fn is_running(&self, key: &CredentialKey) -> bool {
        self.jobs
            .get(key)
            .is_some_and(|entry| !entry.state.borrow().is_terminal())
    }
}

/// Forwards intermediate states from the worker, then records the outcome
/// and publishes the terminal state.
async fn supervise(
    key: CredentialKey,
    mut worker: JoinHandle<Result<CaptureReport, BrokerError>>,
    mut progress: watch::Receiver<CaptureState>,
    published: watch::Sender<CaptureState>,
    detail: Arc<Mutex<JobDetail>>,
) {
    let joined = loop {
        tokio::select! {
            joined = &mut worker => break joined,
            changed = progress.changed() => {
                if changed.is_err() {
                    // worker dropped its sender: finished or panicked
                    break (&mut worker).await;
                }
                let state = *progress.borrow_and_update();
                if !state.is_terminal() {
                    published.send_replace(state);
                }
            }
        }
    };

    let last = *progress.borrow();
    let terminal = {
        let mut detail = match detail.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        detail.finished_at = Some(Utc::now());
        match joined {
            Ok(Ok(report)) => {
                info!(key = %report.key, iterations = report.iterations, "Capture job finished");
                detail.iterations = Some(report.iterations);
                CaptureState::Captured
            }
            Ok(Err(e)) => {
                error!(key = %key, error = %e, "Capture job failed");
                detail.error = Some(e.to_string());
                if last.is_terminal() {
                    last
                } else {
                    CaptureState::Failed
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "Capture task aborted");
                detail.error = Some(format!(
                    "capture task aborted ({}). Visit /auth/{}/setup?account={} to retry.",
                    if e.is_panic() { "panic" } else { "cancelled" },
                    key.provider,
                    key.account
                ));
                CaptureState::Failed
            }
        }
    };
    published.send_replace(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{engine_with, FakeDriver, Scenario};
    use crate::capture::{BrowserDriver, BrowserPage, CaptureSettings, LaunchMode};
    use crate::credentials::CredentialStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct PanickingDriver;

    #[async_trait]
    impl BrowserDriver for PanickingDriver {
        async fn launch(&self, _mode: LaunchMode) -> anyhow::Result<Box<dyn BrowserPage>> {
            panic!("browser process crashed");
        }
    }

    async fn wait_terminal(jobs: &CaptureJobs, key: &CredentialKey) -> JobSnapshot {
        for _ in 0..200 {
            if let Some(snapshot) = jobs.snapshot(key) {
                if snapshot.state.is_terminal() {
                    assert!(snapshot.finished_at.is_some(), "terminal state before finished_at");
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture job did not finish");
    }

    #[tokio::test]
    async fn test_job_runs_to_captured() {
        let driver = FakeDriver::new(Scenario::linkedin_signal_on_iteration(2));
        let (_dir, store, engine) = engine_with(driver);
        let jobs = CaptureJobs::new(Arc::new(engine));

        let start = jobs.start(CaptureProfile::linkedin(), "default", Some(Scenario::login()));
        assert!(matches!(start, JobStart::Started(_)));

        let key = CredentialKey::new("linkedin", "default");
        let snapshot = wait_terminal(&jobs, &key).await;
        assert_eq!(snapshot.state, CaptureState::Captured);
        assert_eq!(snapshot.iterations, Some(2));
        assert!(snapshot.error.is_none());
        assert!(store.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_one_job_per_key() {
        let scenario = Scenario::linkedin_signal_on_iteration(50);
        let (_dir, _store, engine) = engine_with(FakeDriver::new(scenario));
        let jobs = CaptureJobs::new(Arc::new(engine));

        let first = jobs.start(CaptureProfile::linkedin(), "default", Some(Scenario::login()));
        assert!(matches!(first, JobStart::Started(_)));

        let second = jobs.start(CaptureProfile::linkedin(), "default", Some(Scenario::login()));
        assert!(matches!(second, JobStart::AlreadyRunning(_)));

        let other = jobs.start(CaptureProfile::linkedin(), "work", Some(Scenario::login()));
        assert!(matches!(other, JobStart::Started(_)));
    }

    #[tokio::test]
    async fn test_failed_job_reports_error() {
        let mut scenario = Scenario::linkedin_signal_on_iteration(1);
        scenario.form = false;
        let (_dir, _store, engine) = engine_with(FakeDriver::new(scenario));
        let jobs = CaptureJobs::new(Arc::new(engine));

        jobs.start(CaptureProfile::linkedin(), "default", Some(Scenario::login()));
        let snapshot = wait_terminal(&jobs, &CredentialKey::new("linkedin", "default")).await;
        assert_eq!(snapshot.state, CaptureState::Failed);
        assert!(snapshot
            .error
            .unwrap()
            .contains("/auth/linkedin/setup?account=default"));
    }

    #[tokio::test]
    async fn test_panicking_capture_ends_failed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
        let settings = CaptureSettings {
            poll_interval: Duration::from_millis(1),
            max_iterations: 5,
            form_wait_iterations: 1,
            headless: true,
        };
        let engine = CaptureEngine::new(Arc::new(PanickingDriver), store, settings);
        let jobs = CaptureJobs::new(Arc::new(engine));
        let key = CredentialKey::new("linkedin", "default");

        jobs.start(CaptureProfile::linkedin(), "default", None);
        let snapshot = wait_terminal(&jobs, &key).await;

        assert_eq!(snapshot.state, CaptureState::Failed);
        assert!(snapshot.error.unwrap().contains("panic"));
        assert!(!jobs.is_running(&key));

        // the key is free for a new attempt
        let again = jobs.start(CaptureProfile::linkedin(), "default", None);
        assert!(matches!(again, JobStart::Started(_)));
    }
}
