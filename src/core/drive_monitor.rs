//! Polls for attached drives and publishes the list.
//!
//! Drives are only listed here; mounting stays with the job that needs the
//! drive. Connect and removal are reported as [`HardwareEvent`]s in the log
//! and as a new list to every subscriber.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::hardware::{BlockDevice, DeviceProbe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    DeviceAdded(BlockDevice),
    DeviceRemoved(PathBuf),
}

pub struct DriveMonitor {
    tx: watch::Sender<Vec<BlockDevice>>,
}

impl Default for DriveMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Drives seen by the latest poll.
    pub fn current(&self) -> Vec<BlockDevice> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<BlockDevice>> {
        self.tx.subscribe()
    }

    /// Replace the drive list with `devices` and return what changed.
    /// Subscribers are only woken when something did.
    pub fn update(&self, devices: Vec<BlockDevice>) -> Vec<HardwareEvent> {
        let mut events = Vec::new();
        self.tx.send_if_modified(|current| {
            let before: HashSet<&PathBuf> = current.iter().map(|d| &d.path).collect();
            let after: HashSet<&PathBuf> = devices.iter().map(|d| &d.path).collect();

            events.extend(
                devices
                    .iter()
                    .filter(|d| !before.contains(&d.path))
                    .cloned()
                    .map(HardwareEvent::DeviceAdded),
            );
            events.extend(
                current
                    .iter()
                    .filter(|d| !after.contains(&d.path))
                    .map(|d| HardwareEvent::DeviceRemoved(d.path.clone())),
            );

            if *current == devices {
                return false;
            }
            *current = devices;
            true
        });
        events
    }

    /// Poll `lister` every `interval` until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        lister: Arc<dyn DeviceProbe>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let lister = lister.clone();
            let devices = match tokio::task::spawn_blocking(move || lister.list_devices()).await {
                Ok(Ok(devices)) => devices,
                Ok(Err(e)) => {
                    warn!(error = %e, "Drive poll failed");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Drive poll task failed");
                    continue;
                }
            };

            for event in self.update(devices) {
                match event {
                    HardwareEvent::DeviceAdded(device) => info!(
                        device = %device.path.display(),
                        model = %device.model,
                        filesystem = %device.filesystem,
                        capacity = device.capacity,
                        "Drive connected"
                    ),
                    HardwareEvent::DeviceRemoved(path) => {
                        info!(device = %path.display(), "Drive removed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn drive(path: &str) -> BlockDevice {
        BlockDevice {
            path: PathBuf::from(path),
            model: "Card Reader".to_string(),
            capacity: 64_000_000_000,
            filesystem: "exfat".to_string(),
            mount_point: None,
        }
    }

    struct ScriptedDrives {
        devices: Mutex<Vec<BlockDevice>>,
    }

    impl DeviceProbe for ScriptedDrives {
        fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    #[test]
    fn test_update_reports_added_and_removed() {
        let monitor = DriveMonitor::new();

        let events = monitor.update(vec![drive("/dev/sdb1")]);
        assert_eq!(events, vec![HardwareEvent::DeviceAdded(drive("/dev/sdb1"))]);

        assert!(monitor.update(vec![drive("/dev/sdb1")]).is_empty());

        let events = monitor.update(vec![drive("/dev/sdc1")]);
        assert_eq!(
            events,
            vec![
                HardwareEvent::DeviceAdded(drive("/dev/sdc1")),
                HardwareEvent::DeviceRemoved(PathBuf::from("/dev/sdb1")),
            ]
        );
        assert_eq!(monitor.current(), vec![drive("/dev/sdc1")]);
    }

    #[tokio::test]
    async fn test_run_publishes_changes_until_shutdown() {
        let monitor = Arc::new(DriveMonitor::new());
        let attached = Arc::new(ScriptedDrives {
            devices: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let mut rx = monitor.subscribe();

        let task = tokio::spawn(monitor.clone().run(
            attached.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        attached.devices.lock().unwrap().push(drive("/dev/sdb1"));
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|d| !d.is_empty()))
            .await
            .unwrap()
            .unwrap();

        attached.devices.lock().unwrap().clear();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|d| d.is_empty()))
            .await
            .unwrap()
            .unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }
}
