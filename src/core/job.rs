//! Shared state of one transfer job.
//!
//! The engine task is the only writer. The sampler, the orchestrator and RPC
//! handlers read the counters without locking; they are published with
//! atomics so reads never block the copy loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::manifest::{EnumerationError, Manifest};
use crate::core::models::{FileProgress, FileStatus, JobErrorRecord, JobRecord, JobState};
use crate::core::mount::MountError;

const NO_CURRENT_FILE: usize = usize::MAX;

/// Failures that abort a job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("mount failed: {0}")]
    Mount(#[from] MountError),
    #[error("enumeration failed: {0}")]
    Enumeration(#[from] EnumerationError),
    #[error("{failures} consecutive copy failures, last: {last}")]
    SystemicIo { failures: u32, last: String },
    #[error("{0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mount(e) => e.kind.as_str(),
            Self::Enumeration(e) => e.kind(),
            Self::SystemicIo { .. } => "systemic_io_error",
            Self::Internal(_) => "internal",
        }
    }

    pub fn to_record(&self) -> JobErrorRecord {
        JobErrorRecord {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

pub struct TransferJob {
    id: String,
    project: String,
    started_at: DateTime<Utc>,
    started: Instant,
    state: watch::Sender<JobState>,
    manifest: OnceLock<Arc<Manifest>>,
    file_status: OnceLock<Vec<AtomicU8>>,
    destination: OnceLock<String>,
    destination_root: OnceLock<PathBuf>,
    bytes_copied: AtomicU64,
    in_flight: AtomicU64,
    current_index: AtomicUsize,
    error_count: AtomicU64,
    files_processed: AtomicUsize,
    files_copied: AtomicUsize,
    files_verified: AtomicUsize,
    last_error: Mutex<Option<String>>,
    error: OnceLock<JobErrorRecord>,
    record: OnceLock<JobRecord>,
    cancel: CancellationToken,
}

impl TransferJob {
    pub fn new(project: impl Into<String>) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            id: Uuid::now_v7().to_string(),
            project: project.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            state,
            manifest: OnceLock::new(),
            file_status: OnceLock::new(),
            destination: OnceLock::new(),
            destination_root: OnceLock::new(),
            bytes_copied: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            current_index: AtomicUsize::new(NO_CURRENT_FILE),
            error_count: AtomicU64::new(0),
            files_processed: AtomicUsize::new(0),
            files_copied: AtomicUsize::new(0),
            files_verified: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            error: OnceLock::new(),
            record: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        self.manifest.get()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.get().map(String::as_str)
    }

    pub fn destination_root(&self) -> Option<&PathBuf> {
        self.destination_root.get()
    }

    pub fn bytes_total(&self) -> u64 {
        self.manifest.get().map(|m| m.total_bytes()).unwrap_or(0)
    }

    /// Bytes of files whose copy completed.
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Acquire)
    }

    /// Bytes written so far for the file being copied.
    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        let index = self.current_index.load(Ordering::Acquire);
        if index == NO_CURRENT_FILE {
            return None;
        }
        self.manifest
            .get()
            .and_then(|m| m.files().get(index))
            .map(|f| f.relative_path.clone())
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn files_total(&self) -> usize {
        self.manifest.get().map(|m| m.len()).unwrap_or(0)
    }

    pub fn files_processed(&self) -> usize {
        self.files_processed.load(Ordering::Acquire)
    }

    pub fn files_copied(&self) -> usize {
        self.files_copied.load(Ordering::Acquire)
    }

    pub fn files_verified(&self) -> usize {
        self.files_verified.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The error that aborted the job, if any.
    pub fn error(&self) -> Option<&JobErrorRecord> {
        self.error.get()
    }

    /// Terminal archive, available once the job has finished.
    pub fn record(&self) -> Option<&JobRecord> {
        self.record.get()
    }

    pub fn file_status(&self, index: usize) -> Option<FileStatus> {
        self.file_status
            .get()
            .and_then(|s| s.get(index))
            .map(|s| FileStatus::from_u8(s.load(Ordering::Acquire)))
    }

    pub fn file_statuses(&self) -> Vec<FileProgress> {
        let Some(manifest) = self.manifest.get() else {
            return Vec::new();
        };
        manifest
            .files()
            .iter()
            .enumerate()
            .map(|(index, file)| FileProgress {
                path: file.relative_path.clone(),
                size: file.size,
                status: self.file_status(index).unwrap_or(FileStatus::Pending),
            })
            .collect()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
    }

    pub(crate) fn set_destination(&self, label: String, root: PathBuf) {
        let _ = self.destination.set(label);
        let _ = self.destination_root.set(root);
    }

    /// Attach the manifest; every file starts `pending`.
    pub(crate) fn set_manifest(&self, manifest: Arc<Manifest>) {
        let statuses = (0..manifest.len())
            .map(|_| AtomicU8::new(FileStatus::Pending.to_u8()))
            .collect();
        let _ = self.file_status.set(statuses);
        let _ = self.manifest.set(manifest);
    }

    pub(crate) fn set_file_status(&self, index: usize, status: FileStatus) {
        if let Some(slot) = self.file_status.get().and_then(|s| s.get(index)) {
            slot.store(status.to_u8(), Ordering::Release);
        }
    }

    pub(crate) fn set_current(&self, index: Option<usize>) {
        self.current_index
            .store(index.unwrap_or(NO_CURRENT_FILE), Ordering::Release);
    }

    pub(crate) fn in_flight_counter(&self) -> &AtomicU64 {
        &self.in_flight
    }

    pub(crate) fn commit_file(&self, bytes: u64) {
        // Order matters for readers summing committed + in-flight
        self.bytes_copied.fetch_add(bytes, Ordering::AcqRel);
        self.in_flight.store(0, Ordering::Release);
        self.files_copied.fetch_add(1, Ordering::AcqRel);
        self.files_processed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn fail_file(&self, message: String) {
        self.in_flight.store(0, Ordering::Release);
        self.files_processed.fetch_add(1, Ordering::AcqRel);
        self.record_error(message);
    }

    pub(crate) fn record_error(&self, message: String) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub(crate) fn mark_verified(&self) {
        self.files_verified.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_error(&self, error: &JobError) {
        let record = error.to_record();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.message.clone());
        let _ = self.error.set(record);
    }

    pub(crate) fn set_record(&self, record: JobRecord) {
        let _ = self.record.set(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::FileDescriptor;

    fn manifest() -> Arc<Manifest> {
        Arc::new(Manifest::new(vec![
            FileDescriptor {
                relative_path: PathBuf::from("b.mov"),
                size: 20,
                hash: None,
            },
            FileDescriptor {
                relative_path: PathBuf::from("a.mov"),
                size: 10,
                hash: None,
            },
        ]))
    }

    #[test]
    fn test_new_job_is_idle() {
        let job = TransferJob::new("wedding");
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.project(), "wedding");
        assert!(Uuid::parse_str(job.id()).is_ok());
        assert!(job.file_statuses().is_empty());
    }

    #[test]
    fn test_counters_follow_file_outcomes() {
        let job = TransferJob::new("p");
        job.set_manifest(manifest());
        assert_eq!(job.bytes_total(), 30);
        assert!(
            job.file_statuses()
                .iter()
                .all(|f| f.status == FileStatus::Pending)
        );

        job.set_current(Some(0));
        assert_eq!(job.current_file(), Some(PathBuf::from("a.mov")));
        job.in_flight_counter().store(5, Ordering::Release);
        job.commit_file(10);
        job.set_file_status(0, FileStatus::Copied);

        job.fail_file("disk full".to_string());
        job.set_file_status(1, FileStatus::Failed);
        job.set_current(None);

        assert_eq!(job.bytes_copied(), 10);
        assert_eq!(job.in_flight_bytes(), 0);
        assert_eq!(job.files_processed(), 2);
        assert_eq!(job.files_copied(), 1);
        assert_eq!(job.error_count(), 1);
        assert_eq!(job.last_error().as_deref(), Some("disk full"));
        assert_eq!(job.file_status(1), Some(FileStatus::Failed));
        assert_eq!(job.current_file(), None);
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let job = Arc::new(TransferJob::new("p"));
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_terminal().await })
        };

        job.set_state(JobState::Copying);
        job.set_state(JobState::Cancelled);
        assert_eq!(waiter.await.unwrap(), JobState::Cancelled);
    }

    #[test]
    fn test_job_error_kinds() {
        let err = JobError::SystemicIo {
            failures: 3,
            last: "EIO".to_string(),
        };
        assert_eq!(err.to_record().kind, "systemic_io_error");
        assert_eq!(JobError::from(EnumerationError::Empty).kind(), "empty");
    }
}
