pub mod broadcast;
pub mod drive_monitor;
pub mod hardware;
pub mod job;
pub mod manifest;
pub mod models;
pub mod mount;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod transfer_engine;
pub mod verifier;

pub use broadcast::{StatusBroadcaster, Subscription};
pub use drive_monitor::{DriveMonitor, HardwareEvent};
pub use hardware::{BlockDevice, DeviceProbe};
pub use job::{JobError, TransferJob};
pub use manifest::{EnumerationError, FileDescriptor, Manifest, ScanOptions};
pub use models::{
    FileProgress, FileStatus, JobRecord, JobState, JobStatusEntry, JobSummary, JobWithHistory,
    ProgressSnapshot, StartOptions,
};
pub use mount::{MountBackend, MountError, MountErrorKind, MountManager, MountedVolume};
pub use orchestrator::{ControlError, Orchestrator, OrchestratorSettings};
pub use progress::ProgressTracker;
pub use speed_test::SpeedTestReport;
