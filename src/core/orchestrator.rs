use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tracing::{info, warn};

use crate::config::TransferConfigProvider;
use crate::core::broadcast::{StatusBroadcaster, Subscription};
use crate::core::hardware::DeviceProbe;
use crate::core::job::TransferJob;
use crate::core::manifest::Manifest;
use crate::core::models::{FileProgress, JobRecord, JobState, ProgressSnapshot, StartOptions};
use crate::core::mount::MountManager;
use crate::core::notifications::{NotificationChannel, NotificationDispatcher, create_notifier};
use crate::core::progress::{ProgressTracker, run_sampler};
use crate::core::speed_test::SpeedTestReport;
use crate::core::transfer_engine::{EngineSettings, FileCopier, TransferEngine};
use crate::db;

const MAX_PROJECT_NAME_LEN: usize = 128;

/// Rejections of control requests. None of them change job state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("transfer {0} is already running")]
    AlreadyActive(String),
    #[error("transfer {0} has finished and must be cleared first")]
    NotCleared(String),
    #[error("no transfer is running")]
    NoActiveJob,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to load transfer settings: {0}")]
    Config(String),
    #[error("{0} is in progress")]
    Busy(&'static str),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub engine: EngineSettings,
    pub sample_interval: Duration,
}

struct ActiveJob {
    job: Arc<TransferJob>,
    task: JoinHandle<JobState>,
    sampler: JoinHandle<()>,
}

/// Owner of the process-wide job slot.
///
/// At most one job occupies the slot. A job's lifetime is tied to the slot,
/// not to the request or connection that started it.
pub struct Orchestrator {
    config: Arc<dyn TransferConfigProvider>,
    engine: Arc<TransferEngine>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    broadcaster: StatusBroadcaster,
    db: Option<Connection>,
    slot: Mutex<Option<ActiveJob>>,
    // Held by a drive preview or speed test, which mount outside a job
    volumes: Mutex<()>,
    last_cleared: Mutex<Option<JobRecord>>,
    sample_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Arc<dyn TransferConfigProvider>,
        mounts: Arc<MountManager>,
        copier: Arc<dyn FileCopier>,
        probe: Arc<dyn DeviceProbe>,
        db: Option<Connection>,
        settings: OrchestratorSettings,
    ) -> Self {
        let engine = TransferEngine::new(mounts, copier, probe, db.clone(), settings.engine);
        Self {
            config,
            engine: Arc::new(engine),
            notifier: None,
            broadcaster: StatusBroadcaster::new(),
            db,
            slot: Mutex::new(None),
            volumes: Mutex::new(()),
            last_cleared: Mutex::new(None),
            sample_interval: settings.sample_interval,
        }
    }

    /// Deliver notifications through `channel` instead of the configured webhook.
    pub fn with_notifier(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(channel);
        self
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    /// Accept a new job and run it in the background. Returns its id.
    pub async fn start(&self, project: &str, options: StartOptions) -> Result<String, ControlError> {
        let project = validate_project(project)?;

        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            let id = active.job.id().to_string();
            return Err(if active.job.state().is_terminal() {
                ControlError::NotCleared(id)
            } else {
                ControlError::AlreadyActive(id)
            });
        }
        if self.volumes.try_lock().is_err() {
            return Err(ControlError::Busy("a drive preview or speed test"));
        }

        let config = self
            .config
            .load()
            .map_err(|e| ControlError::Config(format!("{:#}", e)))?;

        let job = Arc::new(TransferJob::new(project));
        info!(job_id = %job.id(), project = %job.project(), "Transfer accepted");

        if let Some(conn) = &self.db {
            if let Err(e) = db::jobs::create(conn, job.id().to_string(), project.to_string()).await {
                warn!(job_id = %job.id(), error = %e, "Failed to record job");
            }
        }

        let channel = self
            .notifier
            .clone()
            .or_else(|| create_notifier(&config.notifications));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            job.id(),
            &config.notifications.milestones,
            channel,
        ));

        self.broadcaster
            .publish(ProgressTracker::new().snapshot(&job));

        let sampler = tokio::spawn(run_sampler(
            job.clone(),
            dispatcher.clone(),
            self.broadcaster.clone(),
            self.sample_interval,
        ));

        let engine = self.engine.clone();
        let task = {
            let job = job.clone();
            tokio::spawn(async move { engine.run(job, config, options, dispatcher).await })
        };

        let id = job.id().to_string();
        *slot = Some(ActiveJob { job, task, sampler });
        Ok(id)
    }

    /// Request cooperative cancellation of the running job.
    pub async fn cancel(&self) -> Result<(), ControlError> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(active) if !active.job.state().is_terminal() => {
                info!(job_id = %active.job.id(), "Cancellation requested");
                active.job.cancel();
                Ok(())
            }
            _ => Err(ControlError::NoActiveJob),
        }
    }

    /// Release a terminal job from the slot, returning its record.
    ///
    /// The slot is free as soon as this is called; the call itself returns
    /// once the job's queued notifications have been delivered.
    pub async fn clear(&self) -> Result<Option<JobRecord>, ControlError> {
        let (job, task) = {
            let mut slot = self.slot.lock().await;
            let Some(active) = slot.as_ref() else {
                return Ok(None);
            };
            if !active.job.state().is_terminal() {
                return Err(ControlError::AlreadyActive(active.job.id().to_string()));
            }
            let Some(ActiveJob { job, task, sampler }) = slot.take() else {
                return Ok(None);
            };

            // The sampler stops at the terminal state; its final publish
            // must land before the idle snapshot
            if let Err(e) = sampler.await {
                warn!(error = %e, "Progress sampler ended abnormally");
            }
            if let Some(record) = job.record() {
                *self.last_cleared.lock().await = Some(record.clone());
            }
            self.broadcaster.publish(ProgressSnapshot::idle());
            info!(job_id = %job.id(), "Transfer cleared");
            (job, task)
        };

        // Terminal state is set before notifications drain
        if let Err(e) = task.await {
            warn!(error = %e, "Transfer task ended abnormally");
        }
        Ok(job.record().cloned())
    }

    pub fn current(&self) -> ProgressSnapshot {
        self.broadcaster.current()
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub async fn active_job(&self) -> Option<Arc<TransferJob>> {
        self.slot.lock().await.as_ref().map(|a| a.job.clone())
    }

    /// Most recent terminal record: the job in the slot, the last cleared
    /// one, or the newest in the history store.
    pub async fn last_result(&self) -> Option<JobRecord> {
        if let Some(record) = self
            .slot
            .lock()
            .await
            .as_ref()
            .and_then(|a| a.job.record().cloned())
        {
            return Some(record);
        }
        if let Some(record) = self.last_cleared.lock().await.clone() {
            return Some(record);
        }

        let conn = self.db.as_ref()?;
        match db::jobs::latest(conn).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to read latest job record");
                None
            }
        }
    }

    pub async fn file_statuses(&self) -> Vec<FileProgress> {
        match self.slot.lock().await.as_ref() {
            Some(active) => active.job.file_statuses(),
            None => Vec::new(),
        }
    }

    /// Cancel any running job and wait up to `grace` for it to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        let Some(job) = self.active_job().await else {
            return;
        };
        if job.state().is_terminal() {
            return;
        }

        info!(job_id = %job.id(), "Cancelling transfer for shutdown");
        job.cancel();
        if tokio::time::timeout(grace, job.wait_terminal()).await.is_err() {
            warn!(job_id = %job.id(), "Transfer did not stop before shutdown deadline");
        }
    }

    /// Mount the source drive and list what a transfer of `subfolder` would
    /// copy. Refused while a job is running.
    pub async fn preview_files(&self, subfolder: Option<String>) -> Result<Manifest, ControlError> {
        let _volumes = self.reserve_volumes().await?;
        let config = self
            .config
            .load()
            .map_err(|e| ControlError::Config(format!("{:#}", e)))?;
        self.engine
            .preview(&config, subfolder)
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))
    }

    /// Time a write of `speed_test_bytes` to the destination share. Refused
    /// while a job is running.
    pub async fn speed_test(&self) -> Result<SpeedTestReport, ControlError> {
        let _volumes = self.reserve_volumes().await?;
        let config = self
            .config
            .load()
            .map_err(|e| ControlError::Config(format!("{:#}", e)))?;
        info!(bytes = config.speed_test_bytes, "Starting speed test");
        self.engine
            .speed_test(&config, config.speed_test_bytes)
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))
    }

    async fn reserve_volumes(&self) -> Result<MutexGuard<'_, ()>, ControlError> {
        let slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.job.state().is_terminal() {
                return Err(ControlError::AlreadyActive(active.job.id().to_string()));
            }
        }
        self.volumes
            .try_lock()
            .map_err(|_| ControlError::Busy("a drive preview or speed test"))
    }
}

fn validate_project(project: &str) -> Result<&str, ControlError> {
    let project = project.trim();
    if project.is_empty() {
        return Err(ControlError::InvalidRequest("project name is required".to_string()));
    }
    if project.len() > MAX_PROJECT_NAME_LEN {
        return Err(ControlError::InvalidRequest("project name is too long".to_string()));
    }
    if project == "." || project == ".." || project.contains(['/', '\\', '\0']) {
        return Err(ControlError::InvalidRequest(format!(
            "project name {:?} cannot be used as a folder name",
            project
        )));
    }
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_project() {
        assert_eq!(validate_project("  Wedding 2026 "), Ok("Wedding 2026"));
        assert!(validate_project("").is_err());
        assert!(validate_project("..").is_err());
        assert!(validate_project("a/b").is_err());
        assert!(validate_project(&"x".repeat(200)).is_err());
    }
}
