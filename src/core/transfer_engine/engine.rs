//! The job state machine.
//!
//! One call to [`TransferEngine::run`] drives a job from `mounting` to a
//! terminal state. Mount and enumeration failures abort the job, single-file
//! failures are recorded and skipped, and a run of consecutive failed
//! attempts aborts it as a systemic I/O error.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_rusqlite::Connection;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{FileCopier, FileCopyRequest};
use crate::config::TransferConfig;
use crate::core::hardware::{DeviceProbe, SupportedFilesystem};
use crate::core::job::{JobError, TransferJob};
use crate::core::manifest::{self, EnumerationError, Manifest, ScanOptions};
use crate::core::models::{FileStatus, JobRecord, JobState, StartOptions};
use crate::core::mount::{
    DestinationSpec, MountError, MountErrorKind, MountManager, MountedVolume, SourceRetry,
    SourceSpec, VolumeSpec,
};
use crate::core::notifications::{EventKind, EventPayload, NotificationDispatcher};
use crate::core::progress::{ProgressTracker, committed_percent};
use crate::core::speed_test::{self, SpeedTestReport};
use crate::core::verifier::{self, VerifyOutcome};
use crate::db;

/// Failed file names kept in the terminal record
const MAX_FAILED_FILES: usize = 50;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub source_mount: PathBuf,
    pub destination_mount: PathBuf,
}

pub struct TransferEngine {
    mounts: Arc<MountManager>,
    copier: Arc<dyn FileCopier>,
    probe: Arc<dyn DeviceProbe>,
    db: Option<Connection>,
    settings: EngineSettings,
}

/// Where the files of a running job go.
struct Placement {
    source_root: PathBuf,
    destination_root: PathBuf,
}

impl TransferEngine {
    pub fn new(
        mounts: Arc<MountManager>,
        copier: Arc<dyn FileCopier>,
        probe: Arc<dyn DeviceProbe>,
        db: Option<Connection>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            mounts,
            copier,
            probe,
            db,
            settings,
        }
    }

    /// Run `job` to a terminal state. Never returns an error: the outcome is
    /// recorded on the job, in the history store and through notifications.
    pub async fn run(
        &self,
        job: Arc<TransferJob>,
        config: TransferConfig,
        options: StartOptions,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> JobState {
        let span = info_span!("transfer_job", job_id = %job.id(), project = %job.project());
        self.run_job(job, config, options, dispatcher)
            .instrument(span)
            .await
    }

    async fn run_job(
        &self,
        job: Arc<TransferJob>,
        config: TransferConfig,
        options: StartOptions,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> JobState {
        info!("Starting transfer job");

        let mut volumes: Vec<MountedVolume> = Vec::new();
        let outcome = self
            .execute(&job, &config, &options, &dispatcher, &mut volumes)
            .await;

        // Both volumes are released exactly once, whatever the outcome
        for volume in volumes.iter().rev() {
            self.mounts.release(volume).await;
        }

        let state = match &outcome {
            Ok(state) => *state,
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Transfer job failed");
                job.set_error(e);
                JobState::Failed
            }
        };

        let mut payload = EventPayload::from(&ProgressTracker::new().snapshot(&job));
        match state {
            JobState::Completed => {
                let committed = committed_percent(job.bytes_copied(), job.bytes_total());
                dispatcher.observe_progress(committed, &payload).await;
                dispatcher.notify(EventKind::Completed, payload).await;
            }
            JobState::Failed => {
                payload.error = job.error().map(|e| e.message.clone());
                dispatcher.notify(EventKind::Failed, payload).await;
            }
            _ => {}
        }

        let record = build_record(&job, state, dispatcher.fired_milestones().await);
        if let Some(conn) = &self.db {
            if let Err(e) = db::jobs::finish(conn, &record).await {
                warn!(error = %e, "Failed to archive job record");
            }
        }
        job.set_record(record);

        let description = job.error().map(|e| e.message.clone());
        self.transition(&job, state, description).await;

        info!(
            state = %state,
            files_copied = job.files_copied(),
            bytes = job.bytes_copied(),
            errors = job.error_count(),
            duration_secs = job.elapsed().as_secs(),
            "Transfer job finished"
        );

        dispatcher.close().await;
        state
    }

    async fn execute(
        &self,
        job: &Arc<TransferJob>,
        config: &TransferConfig,
        options: &StartOptions,
        dispatcher: &NotificationDispatcher,
        volumes: &mut Vec<MountedVolume>,
    ) -> Result<JobState, JobError> {
        self.transition(job, JobState::Mounting, None).await;
        let placement = self.mount_volumes(job, config, volumes).await?;

        if job.is_cancelled() {
            return Ok(JobState::Cancelled);
        }
        self.transition(job, JobState::Scanning, None).await;
        let manifest = self.scan(config, options, &placement.source_root).await?;
        info!(
            total_files = manifest.len(),
            total_bytes = manifest.total_bytes(),
            "Scan complete"
        );
        job.set_manifest(manifest.clone());

        if job.is_cancelled() {
            return Ok(JobState::Cancelled);
        }
        self.transition(job, JobState::Copying, None).await;
        dispatcher
            .notify(
                EventKind::Started,
                EventPayload::from(&ProgressTracker::new().snapshot(job)),
            )
            .await;

        if let Some(state) = self.copy_files(job, config, &manifest, &placement).await? {
            return Ok(state);
        }

        if config.verify_checksums {
            if job.is_cancelled() {
                return Ok(JobState::Cancelled);
            }
            self.transition(job, JobState::Verifying, None).await;
            if let Some(state) = self.verify_files(job, &manifest, &placement).await {
                return Ok(state);
            }
        }

        Ok(JobState::Completed)
    }

    async fn mount_volumes(
        &self,
        job: &TransferJob,
        config: &TransferConfig,
        volumes: &mut Vec<MountedVolume>,
    ) -> Result<Placement, JobError> {
        let retry = source_retry(config);

        let device = self.resolve_source_device(config).await?;
        let source = self.mounts.acquire(&self.source_spec(device), retry).await?;
        volumes.push(source.clone());

        let destination = self
            .mounts
            .acquire(&self.destination_spec(config), retry)
            .await?;
        volumes.push(destination.clone());

        let relative = destination_relative(&config.subfolder, job.project()).ok_or_else(|| {
            JobError::Internal(format!("invalid destination subfolder: {}", config.subfolder))
        })?;
        let destination_root = destination.mount_point.join(&relative);
        let label = format!("{}/{}", destination.source, relative.display());
        info!(destination = %label, "Destination resolved");
        job.set_destination(label, destination_root.clone());

        Ok(Placement {
            source_root: source.mount_point,
            destination_root,
        })
    }

    fn source_spec(&self, device: PathBuf) -> VolumeSpec {
        VolumeSpec::Source(SourceSpec {
            device,
            mount_point: self.settings.source_mount.clone(),
            options: Vec::new(),
        })
    }

    fn destination_spec(&self, config: &TransferConfig) -> VolumeSpec {
        VolumeSpec::Destination(DestinationSpec {
            primary_address: config.nas_address.clone(),
            secondary_address: config.nas_address_fallback.clone(),
            share: config.share_name.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            protocol_version: config.protocol_version.clone(),
            mount_point: self.settings.destination_mount.clone(),
        })
    }

    /// Mount the source drive, list the files a job would copy from
    /// `subfolder`, and unmount. An empty drive yields an empty manifest.
    pub async fn preview(
        &self,
        config: &TransferConfig,
        subfolder: Option<String>,
    ) -> Result<Manifest, JobError> {
        let device = self.resolve_source_device(config).await?;
        let source = self
            .mounts
            .acquire(&self.source_spec(device), source_retry(config))
            .await?;

        let scan = ScanOptions {
            min_file_size: config.min_file_size,
            hash: false,
            selection: None,
        };
        let result = enumerate_blocking(
            source.mount_point.clone(),
            subfolder.unwrap_or_default(),
            scan,
        )
        .await;
        self.mounts.release(&source).await;

        match result {
            Err(JobError::Enumeration(EnumerationError::Empty)) => Ok(Manifest::new(Vec::new())),
            other => other,
        }
    }

    /// Mount the destination share, time a `bytes` write to it, and unmount.
    pub async fn speed_test(
        &self,
        config: &TransferConfig,
        bytes: u64,
    ) -> Result<SpeedTestReport, JobError> {
        let destination = self
            .mounts
            .acquire(&self.destination_spec(config), source_retry(config))
            .await?;

        let dir = destination.mount_point.clone();
        let result = tokio::task::spawn_blocking(move || speed_test::measure_write(&dir, bytes))
            .await
            .map_err(|e| JobError::Internal(format!("speed test task failed: {}", e)))
            .and_then(|r| r.map_err(|e| JobError::Internal(format!("speed test write failed: {}", e))));
        self.mounts.release(&destination).await;

        let mut report = result?;
        report.destination = destination.source;
        info!(
            destination = %report.destination,
            bytes = report.bytes_written,
            bytes_per_sec = report.bytes_per_sec as u64,
            "Speed test finished"
        );
        Ok(report)
    }

    /// Configured device, else the first attached USB partition with a
    /// filesystem we can read.
    async fn resolve_source_device(&self, config: &TransferConfig) -> Result<PathBuf, JobError> {
        if let Some(device) = &config.source_device {
            return Ok(device.clone());
        }

        let probe = self.probe.clone();
        let devices = tokio::task::spawn_blocking(move || probe.list_devices())
            .await
            .map_err(|e| JobError::Internal(format!("device probe task failed: {}", e)))?;

        let devices = match devices {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Failed to list block devices");
                Vec::new()
            }
        };

        devices
            .iter()
            .find(|d| SupportedFilesystem::parse(&d.filesystem).is_some())
            .or_else(|| devices.first())
            .map(|d| {
                debug!(device = %d.path.display(), model = %d.model, "Selected source device");
                d.path.clone()
            })
            .ok_or_else(|| {
                JobError::Mount(MountError::new(
                    MountErrorKind::NotFound,
                    &self.settings.source_mount,
                    "no removable drive detected",
                ))
            })
    }

    async fn scan(
        &self,
        config: &TransferConfig,
        options: &StartOptions,
        source_root: &Path,
    ) -> Result<Arc<Manifest>, JobError> {
        let scan = ScanOptions {
            min_file_size: config.min_file_size,
            hash: config.verify_checksums,
            selection: options.files.clone(),
        };
        let manifest = enumerate_blocking(
            source_root.to_path_buf(),
            options.source_subfolder.clone().unwrap_or_default(),
            scan,
        )
        .await?;
        Ok(Arc::new(manifest))
    }

    /// Copy every file in manifest order. Returns `Some(Cancelled)` when
    /// cancellation was observed between files.
    async fn copy_files(
        &self,
        job: &Arc<TransferJob>,
        config: &TransferConfig,
        manifest: &Manifest,
        placement: &Placement,
    ) -> Result<Option<JobState>, JobError> {
        let threshold = config.failure_threshold.max(1);
        let mut consecutive_failures: u32 = 0;

        for (index, file) in manifest.files().iter().enumerate() {
            if job.is_cancelled() {
                job.set_current(None);
                return Ok(Some(JobState::Cancelled));
            }

            job.set_current(Some(index));
            job.set_file_status(index, FileStatus::Copying);
            let request = FileCopyRequest {
                source: placement.source_root.join(&file.relative_path),
                destination: placement.destination_root.join(&file.relative_path),
                expected_size: file.size,
            };
            debug!(file = %file.relative_path.display(), bytes = file.size, "Copying file");

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match self.copy_one(job, &request).await {
                    Ok(bytes) => {
                        consecutive_failures = 0;
                        job.commit_file(bytes);
                        job.set_file_status(index, FileStatus::Copied);
                        break;
                    }
                    Err(message) => {
                        consecutive_failures += 1;
                        warn!(
                            file = %file.relative_path.display(),
                            attempt,
                            error = %message,
                            "Copy attempt failed"
                        );

                        let exhausted = attempt > config.file_retries;
                        if consecutive_failures >= threshold || exhausted {
                            job.fail_file(format!("{}: {}", file.relative_path.display(), message));
                            job.set_file_status(index, FileStatus::Failed);
                        }
                        if consecutive_failures >= threshold {
                            job.set_current(None);
                            return Err(JobError::SystemicIo {
                                failures: consecutive_failures,
                                last: message,
                            });
                        }
                        if exhausted {
                            break;
                        }
                        job.in_flight_counter()
                            .store(0, std::sync::atomic::Ordering::Release);
                    }
                }
            }
        }

        job.set_current(None);
        Ok(None)
    }

    async fn copy_one(&self, job: &Arc<TransferJob>, request: &FileCopyRequest) -> Result<u64, String> {
        let copier = self.copier.clone();
        let job = job.clone();
        let request = request.clone();

        let result = tokio::task::spawn_blocking(move || {
            let result = copier.copy_file(&request, job.in_flight_counter());
            (request, result)
        })
        .await
        .map_err(|e| format!("copy task failed: {}", e))?;

        match result {
            (request, Ok(bytes)) if bytes == request.expected_size => Ok(bytes),
            (request, Ok(bytes)) => Err(format!(
                "size mismatch: expected {} bytes, copied {}",
                request.expected_size, bytes
            )),
            (_, Err(e)) => {
                if e.is_device_removed {
                    error!(error = %e.message, "Device appears to have been removed");
                }
                Err(e.message)
            }
        }
    }

    /// Re-hash every copied file. Returns `Some(Cancelled)` on cancellation.
    async fn verify_files(
        &self,
        job: &TransferJob,
        manifest: &Manifest,
        placement: &Placement,
    ) -> Option<JobState> {
        for (index, file) in manifest.files().iter().enumerate() {
            if job.file_status(index) != Some(FileStatus::Copied) {
                continue;
            }
            let Some(expected) = file.hash else {
                continue;
            };
            if job.is_cancelled() {
                job.set_current(None);
                return Some(JobState::Cancelled);
            }

            job.set_current(Some(index));
            let destination = placement.destination_root.join(&file.relative_path);
            let outcome =
                tokio::task::spawn_blocking(move || verifier::verify_file(&destination, &expected))
                    .await
                    .unwrap_or_else(|e| VerifyOutcome::Unreadable(e.to_string()));

            if outcome.is_match() {
                job.mark_verified();
            } else {
                warn!(
                    file = %file.relative_path.display(),
                    reason = %outcome.describe(),
                    "Verification failed"
                );
                job.set_file_status(index, FileStatus::VerifyFailed);
                job.record_error(format!(
                    "{}: {}",
                    file.relative_path.display(),
                    outcome.describe()
                ));
            }
        }

        job.set_current(None);
        None
    }

    async fn transition(&self, job: &TransferJob, state: JobState, description: Option<String>) {
        job.set_state(state);
        info!(state = %state, "Job state changed");

        if let Some(conn) = &self.db {
            if let Err(e) =
                db::jobs::update_status(conn, job.id().to_string(), state.as_str(), description)
                    .await
            {
                warn!(error = %e, "Failed to record job status");
            }
        }
    }
}

fn source_retry(config: &TransferConfig) -> SourceRetry {
    SourceRetry {
        attempts: config.mount_retries.max(1),
        delay: Duration::from_millis(config.mount_retry_delay_ms),
    }
}

async fn enumerate_blocking(
    source_root: PathBuf,
    subfolder: String,
    scan: ScanOptions,
) -> Result<Manifest, JobError> {
    let manifest =
        tokio::task::spawn_blocking(move || manifest::enumerate(&source_root, &subfolder, &scan))
            .await
            .map_err(|e| JobError::Internal(format!("scan task failed: {}", e)))??;
    Ok(manifest)
}

/// `<subfolder>/<project>` with every component checked to stay inside the share.
fn destination_relative(subfolder: &str, project: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for part in [subfolder.trim_matches('/'), project] {
        if part.is_empty() {
            continue;
        }
        let path = Path::new(part);
        if !path.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        relative.push(path);
    }
    Some(relative)
}

fn build_record(job: &TransferJob, state: JobState, milestones_notified: Vec<u8>) -> JobRecord {
    let statuses = job.file_statuses();
    let count = |status: FileStatus| statuses.iter().filter(|f| f.status == status).count();

    JobRecord {
        id: job.id().to_string(),
        project: job.project().to_string(),
        state,
        started_at: job.started_at(),
        finished_at: Utc::now(),
        duration_secs: job.elapsed().as_secs(),
        destination: job.destination().map(str::to_string),
        files_total: job.files_total(),
        files_copied: job.files_copied(),
        files_failed: count(FileStatus::Failed),
        files_verify_failed: count(FileStatus::VerifyFailed),
        bytes_total: job.bytes_total(),
        bytes_copied: job.bytes_copied(),
        error_count: job.error_count(),
        error: job.error().cloned(),
        failed_files: statuses
            .iter()
            .filter(|f| matches!(f.status, FileStatus::Failed | FileStatus::VerifyFailed))
            .take(MAX_FAILED_FILES)
            .map(|f| f.path.clone())
            .collect(),
        milestones_notified,
    }
}
