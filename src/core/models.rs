use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a transfer job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal. A terminal job stays in
/// the orchestrator's slot until a client clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Mounting,
    Scanning,
    Copying,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Mounting => "mounting",
            Self::Scanning => "scanning",
            Self::Copying => "copying",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Copying,
    Copied,
    VerifyFailed,
    Failed,
}

impl FileStatus {
    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Copying,
            2 => Self::Copied,
            3 => Self::VerifyFailed,
            4 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Point-in-time view of a job, rebuilt on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Option<String>,
    pub project: Option<String>,
    pub state: JobState,
    pub percent: f64,
    pub bytes_copied: u64,
    pub bytes_total: u64,
    /// Bytes written so far for the file being copied
    pub current_file_bytes: u64,
    pub files_total: usize,
    pub files_processed: usize,
    pub files_copied: usize,
    pub files_verified: usize,
    /// Smoothed bytes/sec
    pub throughput_bps: f64,
    pub eta_secs: Option<u64>,
    pub current_file: Option<String>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub destination: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
}

impl ProgressSnapshot {
    /// Snapshot shown while no job occupies the slot.
    pub fn idle() -> Self {
        Self {
            job_id: None,
            project: None,
            state: JobState::Idle,
            percent: 0.0,
            bytes_copied: 0,
            bytes_total: 0,
            current_file_bytes: 0,
            files_total: 0,
            files_processed: 0,
            files_copied: 0,
            files_verified: 0,
            throughput_bps: 0.0,
            eta_secs: None,
            current_file: None,
            error_count: 0,
            last_error: None,
            destination: None,
            started_at: None,
            elapsed_secs: 0,
        }
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorRecord {
    /// e.g. `unreachable`, `empty`, `systemic_io_error`
    pub kind: String,
    pub message: String,
}

/// Terminal archive of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub destination: Option<String>,
    pub files_total: usize,
    pub files_copied: usize,
    pub files_failed: usize,
    pub files_verify_failed: usize,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub error_count: u64,
    pub error: Option<JobErrorRecord>,
    pub failed_files: Vec<PathBuf>,
    pub milestones_notified: Vec<u8>,
}

/// Row from the history store's job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub project: String,
    pub status: String,
    pub created_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEntry {
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithHistory {
    pub summary: JobSummary,
    pub record: Option<JobRecord>,
    pub history: Vec<JobStatusEntry>,
}

/// Options accepted with a start request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Folder on the source volume to transfer; whole volume when unset
    #[serde(default)]
    pub source_subfolder: Option<String>,
    /// Explicit selection of relative paths; every file when unset
    #[serde(default)]
    pub files: Option<Vec<PathBuf>>,
}

/// Per-file status entry returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub path: PathBuf,
    pub size: u64,
    pub status: FileStatus,
}
