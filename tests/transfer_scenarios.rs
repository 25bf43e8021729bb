use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offloader::adapters::{SimulatedMountBackend, SimulatedProbe};
use offloader::config::{StaticConfigProvider, TransferConfig};
use offloader::core::notifications::{EventKind, NotificationChannel, NotificationEvent};
use offloader::core::transfer_engine::{
    EngineSettings, FileCopier, FileCopyError, FileCopyRequest, NativeCopier,
};
use offloader::core::mount::MountRequest;
use offloader::core::{
    ControlError, FileStatus, JobRecord, JobState, MountBackend, MountError, MountErrorKind,
    MountManager, Orchestrator, OrchestratorSettings, ProgressSnapshot, StartOptions,
};
use offloader::db;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rusqlite::Connection;

const FILE_SIZE: usize = 100_000;
const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingChannel {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingChannel {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fails every attempt for the named files.
struct FaultyCopier {
    inner: NativeCopier,
    broken: Vec<&'static str>,
    attempts: AtomicU64,
}

impl FaultyCopier {
    fn new(broken: Vec<&'static str>) -> Self {
        Self {
            inner: NativeCopier { sync_files: false },
            broken,
            attempts: AtomicU64::new(0),
        }
    }
}

impl FileCopier for FaultyCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let name = request.source.file_name().unwrap().to_string_lossy();
        if self.broken.iter().any(|b| *b == name) {
            return Err(FileCopyError {
                message: "Input/output error".to_string(),
                is_device_removed: false,
            });
        }
        self.inner.copy_file(request, progress)
    }
}

/// Copies correctly, then flips a byte of the named file at the destination.
struct CorruptingCopier {
    inner: NativeCopier,
    victim: &'static str,
}

impl FileCopier for CorruptingCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        let bytes = self.inner.copy_file(request, progress)?;
        if request.destination.ends_with(self.victim) {
            let mut data = std::fs::read(&request.destination).unwrap();
            data[0] ^= 0xff;
            std::fs::write(&request.destination, data).unwrap();
        }
        Ok(bytes)
    }
}

/// Holds the first copy until released.
#[derive(Default)]
struct GatedCopier {
    entered: AtomicBool,
    released: AtomicBool,
}

impl GatedCopier {
    async fn wait_entered(&self) {
        timeout(WAIT, async {
            while !self.entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("copy never started");
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl FileCopier for GatedCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        self.entered.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        NativeCopier { sync_files: false }.copy_file(request, progress)
    }
}

/// Reports 90% of the file in flight, then fails it.
struct StallingCopier;

impl FileCopier for StallingCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        progress.store(request.expected_size * 9 / 10, Ordering::Release);
        std::thread::sleep(Duration::from_millis(120));
        Err(FileCopyError {
            message: "Input/output error".to_string(),
            is_device_removed: false,
        })
    }
}

/// Copies in quarters with a pause between them, failing the named file
/// after three quarters.
struct TricklingCopier {
    broken: &'static str,
}

impl FileCopier for TricklingCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        let quarter = request.expected_size / 4;
        for step in 1..=3 {
            progress.store(quarter * step, Ordering::Release);
            std::thread::sleep(Duration::from_millis(8));
        }
        if request.source.ends_with(self.broken) {
            return Err(FileCopyError {
                message: "Input/output error".to_string(),
                is_device_removed: false,
            });
        }
        NativeCopier { sync_files: false }.copy_file(request, progress)
    }
}

/// Accepts every event after a delay, like a sluggish webhook.
struct SlowChannel {
    delay: Duration,
    delivered: AtomicU64,
}

#[async_trait]
impl NotificationChannel for SlowChannel {
    async fn notify(&self, _event: &NotificationEvent) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Holds the mount of one source until released.
struct GatedMounts {
    inner: Arc<SimulatedMountBackend>,
    gated: &'static str,
    entered: Notify,
    release: Notify,
}

impl GatedMounts {
    fn new(inner: Arc<SimulatedMountBackend>, gated: &'static str) -> Self {
        Self {
            inner,
            gated,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MountBackend for GatedMounts {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        if request.source == self.gated {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.mount(request).await
    }

    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), MountError> {
        self.inner.unmount(mount_point, force).await
    }

    async fn is_mounted(&self, mount_point: &Path) -> bool {
        self.inner.is_mounted(mount_point).await
    }
}

struct Harness {
    _temp: TempDir,
    source: PathBuf,
    nas: PathBuf,
    backend: Arc<SimulatedMountBackend>,
    channel: Arc<RecordingChannel>,
    orchestrator: Arc<Orchestrator>,
}

fn transfer_config() -> TransferConfig {
    TransferConfig {
        nas_address: "10.0.0.5".to_string(),
        nas_address_fallback: Some("192.168.1.5".to_string()),
        source_device: Some(PathBuf::from("/dev/sdz1")),
        min_file_size: 0,
        mount_retries: 2,
        mount_retry_delay_ms: 10,
        ..TransferConfig::default()
    }
}

fn write_clips(dir: &Path, count: usize) {
    for i in 1..=count {
        let data: Vec<u8> = (0..FILE_SIZE).map(|b| (b % 251) as u8 ^ i as u8).collect();
        std::fs::write(dir.join(format!("file{:02}.mov", i)), data).unwrap();
    }
}

fn harness(config: TransferConfig, copier: Arc<dyn FileCopier>, db: Option<Connection>) -> Harness {
    harness_with(config, copier, db, |backend| backend as Arc<dyn MountBackend>, None)
}

/// Like [`harness`], with the mount backend wrapped by `mounts` and
/// notifications going to `notifier` instead of the recording channel.
fn harness_with(
    config: TransferConfig,
    copier: Arc<dyn FileCopier>,
    db: Option<Connection>,
    mounts: impl FnOnce(Arc<SimulatedMountBackend>) -> Arc<dyn MountBackend>,
    notifier: Option<Arc<dyn NotificationChannel>>,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("usb");
    let nas = temp.path().join("nas");
    std::fs::create_dir_all(&source).unwrap();
    write_clips(&source, 10);

    let backend = Arc::new(SimulatedMountBackend::new());
    let channel = Arc::new(RecordingChannel::default());
    let notifier: Arc<dyn NotificationChannel> = match notifier {
        Some(notifier) => notifier,
        None => channel.clone(),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(StaticConfigProvider(config)),
        Arc::new(MountManager::new(mounts(backend.clone()))),
        copier,
        Arc::new(SimulatedProbe::default()),
        db,
        OrchestratorSettings {
            engine: EngineSettings {
                source_mount: source.clone(),
                destination_mount: nas.clone(),
            },
            sample_interval: Duration::from_millis(20),
        },
    )
    .with_notifier(notifier);

    Harness {
        _temp: temp,
        source,
        nas,
        backend,
        channel,
        orchestrator: Arc::new(orchestrator),
    }
}

impl Harness {
    async fn run_to_end(&self, project: &str) -> JobRecord {
        self.orchestrator
            .start(project, StartOptions::default())
            .await
            .unwrap();
        self.wait_terminal().await;
        // Clearing joins the job task, so every notification is delivered
        self.orchestrator.clear().await.unwrap().unwrap()
    }

    async fn wait_state(&self, state: JobState) {
        let job = self.orchestrator.active_job().await.unwrap();
        let mut rx = job.watch_state();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state never reached")
            .unwrap();
    }

    async fn wait_terminal(&self) -> JobState {
        let job = self.orchestrator.active_job().await.unwrap();
        timeout(WAIT, job.wait_terminal()).await.expect("job did not finish")
    }
}

#[tokio::test]
async fn test_clean_offload_completes() {
    let conn = db::init_in_memory().await.unwrap();
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        Some(conn.clone()),
    );

    let record = h.run_to_end("Wedding").await;

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.error_count, 0);
    assert_eq!(record.files_total, 10);
    assert_eq!(record.files_copied, 10);
    assert_eq!(record.bytes_total, 1_000_000);
    assert_eq!(record.bytes_copied, 1_000_000);
    assert_eq!(record.destination.as_deref(), Some("//10.0.0.5/archive/Wedding"));
    assert_eq!(record.milestones_notified, vec![25, 50, 75, 100]);

    assert_eq!(h.channel.count(EventKind::Started), 1);
    assert_eq!(h.channel.count(EventKind::Completed), 1);
    assert_eq!(h.channel.count(EventKind::Milestone(100)), 1);
    assert_eq!(h.channel.count(EventKind::Failed), 0);
    let milestones: Vec<u8> = h
        .channel
        .kinds()
        .into_iter()
        .filter_map(|k| match k {
            EventKind::Milestone(m) => Some(m),
            _ => None,
        })
        .collect();
    assert!(milestones.windows(2).all(|w| w[0] < w[1]));

    let copied = std::fs::read(h.nas.join("Wedding/file07.mov")).unwrap();
    assert_eq!(copied, std::fs::read(h.source.join("file07.mov")).unwrap());

    // Both volumes released
    assert!(h.backend.mounted_source(&h.source).is_none());
    assert!(h.backend.mounted_source(&h.nas).is_none());

    let stored = db::jobs::get_with_history(&conn, record.id.clone())
        .await
        .unwrap()
        .unwrap();
    let statuses: Vec<_> = stored.history.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(
        statuses,
        vec!["idle", "mounting", "scanning", "copying", "completed"]
    );
    assert_eq!(stored.record.unwrap().files_copied, 10);
}

#[tokio::test]
async fn test_repeated_failures_abort_as_systemic() {
    let copier = Arc::new(FaultyCopier::new(vec!["file07.mov", "file08.mov"]));
    let h = harness(transfer_config(), copier.clone(), None);

    h.orchestrator
        .start("Commercial", StartOptions::default())
        .await
        .unwrap();
    let job = h.orchestrator.active_job().await.unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Failed);

    let statuses = job.file_statuses();
    for status in &statuses[..6] {
        assert_eq!(status.status, FileStatus::Copied);
    }
    assert_eq!(statuses[6].status, FileStatus::Failed);
    assert_eq!(statuses[7].status, FileStatus::Failed);
    assert!(statuses[8..].iter().all(|s| s.status == FileStatus::Pending));
    // 6 good copies, file07 twice, file08 once
    assert_eq!(copier.attempts.load(Ordering::SeqCst), 9);

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.error.unwrap().kind, "systemic_io_error");
    assert_eq!(record.bytes_copied, 600_000);
    assert_eq!(h.channel.count(EventKind::Failed), 1);
    assert_eq!(h.channel.count(EventKind::Completed), 0);
    assert!(h.backend.mounted_source(&h.nas).is_none());
}

#[tokio::test]
async fn test_unreachable_primary_falls_back() {
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        None,
    );
    h.backend
        .fail_source("//10.0.0.5/archive", MountErrorKind::Unreachable);

    let record = h.run_to_end("Gala").await;

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.destination.as_deref(), Some("//192.168.1.5/archive/Gala"));
    let sources: Vec<String> = h
        .backend
        .mount_calls()
        .into_iter()
        .map(|r| r.source)
        .collect();
    assert!(sources.contains(&"//10.0.0.5/archive".to_string()));
    assert!(sources.contains(&"//192.168.1.5/archive".to_string()));
}

#[tokio::test]
async fn test_auth_failure_does_not_try_fallback() {
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        None,
    );
    h.backend
        .fail_source("//10.0.0.5/archive", MountErrorKind::AuthFailed);

    let record = h.run_to_end("Gala").await;

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error.unwrap().kind, "auth_failed");
    assert!(
        !h.backend
            .mount_calls()
            .iter()
            .any(|r| r.source == "//192.168.1.5/archive")
    );
    // The source drive was mounted first and must be released
    assert!(h.backend.mounted_source(&h.source).is_none());
    assert_eq!(h.channel.count(EventKind::Failed), 1);
}

#[tokio::test]
async fn test_checksum_mismatch_is_recorded_not_fatal() {
    let config = TransferConfig {
        verify_checksums: true,
        ..transfer_config()
    };
    let h = harness(
        config,
        Arc::new(CorruptingCopier {
            inner: NativeCopier { sync_files: false },
            victim: "file03.mov",
        }),
        None,
    );

    h.orchestrator
        .start("Festival", StartOptions::default())
        .await
        .unwrap();
    let job = h.orchestrator.active_job().await.unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);
    assert_eq!(job.file_statuses()[2].status, FileStatus::VerifyFailed);
    assert_eq!(job.files_verified(), 9);

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.error_count, 1);
    assert_eq!(record.files_verify_failed, 1);
    assert_eq!(record.failed_files, vec![PathBuf::from("file03.mov")]);
}

#[tokio::test]
async fn test_only_one_job_at_a_time() {
    let copier = Arc::new(GatedCopier::default());
    let h = harness(transfer_config(), copier.clone(), None);

    let first = h
        .orchestrator
        .start("One", StartOptions::default())
        .await
        .unwrap();
    copier.wait_entered().await;

    let err = h
        .orchestrator
        .start("Two", StartOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::AlreadyActive(first.clone()));
    assert_eq!(h.orchestrator.current().project.as_deref(), Some("One"));
    assert!(matches!(
        h.orchestrator.clear().await,
        Err(ControlError::AlreadyActive(_))
    ));

    copier.release();
    assert_eq!(h.wait_terminal().await, JobState::Completed);

    let err = h
        .orchestrator
        .start("Two", StartOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::NotCleared(first));

    h.orchestrator.clear().await.unwrap();
    let second = h
        .orchestrator
        .start("Two", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);
    assert_eq!(h.orchestrator.last_result().await.unwrap().id, second);
}

#[tokio::test]
async fn test_cancel_finishes_current_file_then_stops() {
    let copier = Arc::new(GatedCopier::default());
    let h = harness(transfer_config(), copier.clone(), None);

    h.orchestrator
        .start("Cancelled", StartOptions::default())
        .await
        .unwrap();
    copier.wait_entered().await;
    h.orchestrator.cancel().await.unwrap();
    copier.release();

    let job = h.orchestrator.active_job().await.unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Cancelled);

    let statuses = job.file_statuses();
    assert_eq!(statuses[0].status, FileStatus::Copied);
    assert!(statuses.iter().all(|s| s.status != FileStatus::Copying));
    assert!(statuses[1..].iter().all(|s| s.status == FileStatus::Pending));
    assert_eq!(
        h.orchestrator.cancel().await,
        Err(ControlError::NoActiveJob)
    );

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(h.channel.count(EventKind::Completed), 0);
    assert_eq!(h.channel.count(EventKind::Failed), 0);
    assert!(h.backend.mounted_source(&h.nas).is_none());
}

#[tokio::test]
async fn test_subscriber_starts_from_current_snapshot() {
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        None,
    );

    let mut before = h.orchestrator.subscribe();
    assert_eq!(before.next().await, Some(h.orchestrator.current()));

    h.run_to_end("Snapshot").await;

    // Cleared slot goes back to idle, and late subscribers see that first
    let mut after = h.orchestrator.subscribe();
    let first = after.next().await.unwrap();
    assert_eq!(first, h.orchestrator.current());
    assert_eq!(first, ProgressSnapshot::idle());
}

#[tokio::test]
async fn test_invalid_project_is_rejected() {
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        None,
    );

    let err = h
        .orchestrator
        .start("../escape", StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidRequest(_)));
    assert!(h.orchestrator.active_job().await.is_none());
    assert!(h.backend.mount_calls().is_empty());
}

#[tokio::test]
async fn test_selection_limits_transfer() {
    let h = harness(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        None,
    );

    h.orchestrator
        .start(
            "Selected",
            StartOptions {
                source_subfolder: None,
                files: Some(vec![PathBuf::from("file02.mov"), PathBuf::from("file09.mov")]),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.files_total, 2);
    assert_eq!(record.bytes_copied, 200_000);
    assert!(h.nas.join("Selected/file09.mov").exists());
    assert!(!h.nas.join("Selected/file01.mov").exists());
}

fn milestone_kinds(channel: &RecordingChannel) -> Vec<u8> {
    channel
        .kinds()
        .into_iter()
        .filter_map(|k| match k {
            EventKind::Milestone(m) => Some(m),
            _ => None,
        })
        .collect()
}

async fn history(conn: &Connection, id: &str) -> Vec<String> {
    db::jobs::get_with_history(conn, id.to_string())
        .await
        .unwrap()
        .unwrap()
        .history
        .into_iter()
        .map(|e| e.status)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_file_fires_no_milestones() {
    let config = TransferConfig {
        file_retries: 0,
        ..transfer_config()
    };
    let h = harness(config, Arc::new(StallingCopier), None);

    h.orchestrator
        .start(
            "Stalled",
            StartOptions {
                source_subfolder: None,
                files: Some(vec![PathBuf::from("file01.mov")]),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.bytes_copied, 0);
    assert_eq!(record.error_count, 1);
    assert!(record.milestones_notified.is_empty());
    assert!(milestone_kinds(&h.channel).is_empty());
    assert_eq!(h.channel.count(EventKind::Completed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_committed_bytes_never_decrease() {
    let h = harness(
        transfer_config(),
        Arc::new(TricklingCopier { broken: "file04.mov" }),
        None,
    );

    let mut updates = h.orchestrator.subscribe();
    h.orchestrator
        .start("Trickle", StartOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    timeout(WAIT, async {
        while let Some(snapshot) = updates.next().await {
            seen.push(snapshot.bytes_copied);
            if snapshot.state.is_terminal() {
                break;
            }
        }
    })
    .await
    .expect("job did not finish");

    assert!(seen.len() > 3);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last().copied(), Some(900_000));

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.bytes_copied, 900_000);
    // file04 never committed, so 100% is out of reach
    assert_eq!(record.milestones_notified, vec![25, 50, 75]);
}

#[tokio::test]
async fn test_bytes_copied_counts_verify_failures() {
    let config = TransferConfig {
        verify_checksums: true,
        ..transfer_config()
    };
    let h = harness(
        config,
        Arc::new(CorruptingCopier {
            inner: NativeCopier { sync_files: false },
            victim: "file05.mov",
        }),
        None,
    );

    h.orchestrator
        .start("Verify", StartOptions::default())
        .await
        .unwrap();
    let job = h.orchestrator.active_job().await.unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);

    let statuses = job.file_statuses();
    assert_eq!(statuses[4].status, FileStatus::VerifyFailed);
    let written: u64 = statuses
        .iter()
        .filter(|s| matches!(s.status, FileStatus::Copied | FileStatus::VerifyFailed))
        .map(|s| s.size)
        .sum();

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.bytes_copied, written);
    assert_eq!(record.bytes_copied, 1_000_000);
    assert_eq!(record.files_verify_failed, 1);
    assert_eq!(record.failed_files, vec![PathBuf::from("file05.mov")]);
}

#[tokio::test]
async fn test_cancel_while_mounting() {
    let conn = db::init_in_memory().await.unwrap();
    let mut gate = None;
    let h = harness_with(
        transfer_config(),
        Arc::new(NativeCopier { sync_files: false }),
        Some(conn.clone()),
        |backend| {
            let mounts = Arc::new(GatedMounts::new(backend, "//10.0.0.5/archive"));
            gate = Some(mounts.clone());
            mounts as Arc<dyn MountBackend>
        },
        None,
    );
    let gate = gate.unwrap();

    let id = h
        .orchestrator
        .start("Early", StartOptions::default())
        .await
        .unwrap();
    timeout(WAIT, gate.entered.notified())
        .await
        .expect("destination mount never started");
    assert_eq!(h.orchestrator.current().state, JobState::Mounting);

    h.orchestrator.cancel().await.unwrap();
    gate.release.notify_one();
    assert_eq!(h.wait_terminal().await, JobState::Cancelled);

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.files_copied, 0);
    assert_eq!(h.channel.count(EventKind::Started), 0);
    assert!(h.backend.mounted_source(&h.source).is_none());
    assert!(h.backend.mounted_source(&h.nas).is_none());
    assert_eq!(history(&conn, &id).await, vec!["idle", "mounting", "cancelled"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_scanning() {
    let conn = db::init_in_memory().await.unwrap();
    let config = TransferConfig {
        verify_checksums: true,
        ..transfer_config()
    };
    let h = harness(
        config,
        Arc::new(NativeCopier { sync_files: false }),
        Some(conn.clone()),
    );
    // Hashing this keeps the scan busy long enough to cancel inside it
    let large: Vec<u8> = (0..48 * 1024 * 1024u32).map(|b| (b % 253) as u8).collect();
    std::fs::write(h.source.join("file00.mov"), large).unwrap();

    let id = h
        .orchestrator
        .start("Scan", StartOptions::default())
        .await
        .unwrap();
    h.wait_state(JobState::Scanning).await;
    h.orchestrator.cancel().await.unwrap();

    let job = h.orchestrator.active_job().await.unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Cancelled);
    assert!(job.file_statuses().iter().all(|s| s.status == FileStatus::Pending));

    let record = h.orchestrator.clear().await.unwrap().unwrap();
    assert_eq!(record.bytes_copied, 0);
    assert!(!h.nas.join("Scan").exists());
    assert!(h.backend.mounted_source(&h.source).is_none());
    assert!(h.backend.mounted_source(&h.nas).is_none());
    assert_eq!(
        history(&conn, &id).await,
        vec!["idle", "mounting", "scanning", "cancelled"]
    );
}

#[tokio::test]
async fn test_clear_does_not_block_readers_while_notifications_drain() {
    let slow = Arc::new(SlowChannel {
        delay: Duration::from_millis(300),
        delivered: AtomicU64::new(0),
    });
    let config = TransferConfig {
        file_retries: 0,
        ..transfer_config()
    };
    let h = harness_with(
        config,
        Arc::new(NativeCopier { sync_files: false }),
        None,
        |backend| backend as Arc<dyn MountBackend>,
        Some(slow.clone() as Arc<dyn NotificationChannel>),
    );

    h.orchestrator
        .start("Slow", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(h.wait_terminal().await, JobState::Completed);

    let clearing = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.clear().await })
    };
    // Let clear take the job out of the slot
    tokio::time::sleep(Duration::from_millis(20)).await;

    let files = timeout(Duration::from_millis(100), h.orchestrator.file_statuses())
        .await
        .expect("file_statuses blocked behind clear");
    assert!(files.is_empty());
    let last = timeout(Duration::from_millis(100), h.orchestrator.last_result())
        .await
        .expect("last_result blocked behind clear")
        .unwrap();
    assert_eq!(last.state, JobState::Completed);
    assert_eq!(
        timeout(Duration::from_millis(100), h.orchestrator.cancel())
            .await
            .expect("cancel blocked behind clear"),
        Err(ControlError::NoActiveJob)
    );
    assert!(!clearing.is_finished());

    let record = clearing.await.unwrap().unwrap().unwrap();
    assert_eq!(record.id, last.id);
    // Started, four milestones and Completed all reached the channel
    assert_eq!(slow.delivered.load(Ordering::SeqCst), 6);
}
