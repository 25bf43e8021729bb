use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::core::hardware::{BlockDevice, DeviceProbe};
use crate::core::mount::{MountBackend, MountError, MountErrorKind, MountRequest};

#[derive(Default)]
struct State {
    /// mount point -> what is mounted there
    mounted: HashMap<PathBuf, String>,
    always_fail: HashMap<String, MountErrorKind>,
    fail_next: HashMap<String, VecDeque<MountErrorKind>>,
    mount_calls: Vec<MountRequest>,
    unmount_calls: usize,
    forced_unmounts: usize,
}

/// Directories stand in for mounts; failures are scripted per mount source.
///
/// Used by `--simulation` and by tests, so nothing here needs root.
#[derive(Default)]
pub struct SimulatedMountBackend {
    state: Mutex<State>,
}

impl SimulatedMountBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every mount of `source` fails with `kind`.
    pub fn fail_source(&self, source: &str, kind: MountErrorKind) {
        self.state().always_fail.insert(source.to_string(), kind);
    }

    /// The next mount of `source` fails with `kind`; later ones succeed.
    pub fn fail_next(&self, source: &str, kind: MountErrorKind) {
        self.state()
            .fail_next
            .entry(source.to_string())
            .or_default()
            .push_back(kind);
    }

    /// Pretend something outside the manager left a mount at `mount_point`.
    pub fn preload_mount(&self, mount_point: &Path) {
        self.state()
            .mounted
            .insert(mount_point.to_path_buf(), "stale".to_string());
    }

    /// Pretend the resource vanished (drive pulled, share dropped).
    pub fn detach(&self, mount_point: &Path) {
        self.state().mounted.remove(mount_point);
    }

    pub fn mount_calls(&self) -> Vec<MountRequest> {
        self.state().mount_calls.clone()
    }

    pub fn unmount_calls(&self) -> usize {
        self.state().unmount_calls
    }

    pub fn forced_unmounts(&self) -> usize {
        self.state().forced_unmounts
    }

    pub fn mounted_source(&self, mount_point: &Path) -> Option<String> {
        self.state().mounted.get(mount_point).cloned()
    }
}

#[async_trait]
impl MountBackend for SimulatedMountBackend {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        let mut state = self.state();
        state.mount_calls.push(request.clone());

        let scripted = state.always_fail.get(&request.source).copied().or_else(|| {
            state
                .fail_next
                .get_mut(&request.source)
                .and_then(VecDeque::pop_front)
        });
        if let Some(kind) = scripted {
            return Err(MountError::new(kind, &request.target, "simulated failure"));
        }

        if state.mounted.contains_key(&request.target) {
            return Err(MountError::new(
                MountErrorKind::Busy,
                &request.target,
                "mount point already in use",
            ));
        }

        std::fs::create_dir_all(&request.target).map_err(|e| {
            MountError::new(MountErrorKind::NotFound, &request.target, e.to_string())
        })?;
        state
            .mounted
            .insert(request.target.clone(), request.source.clone());
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), MountError> {
        let mut state = self.state();
        state.unmount_calls += 1;
        if force {
            state.forced_unmounts += 1;
        }

        match state.mounted.remove(mount_point) {
            Some(_) => Ok(()),
            None => Err(MountError::new(
                MountErrorKind::NotFound,
                mount_point,
                "not mounted",
            )),
        }
    }

    async fn is_mounted(&self, mount_point: &Path) -> bool {
        self.state().mounted.contains_key(mount_point)
    }
}

/// Reports a fixed set of devices.
pub struct SimulatedProbe {
    devices: Vec<BlockDevice>,
}

impl SimulatedProbe {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self { devices }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new(vec![BlockDevice {
            path: PathBuf::from("/dev/sim0p1"),
            model: "Simulated SSD".to_string(),
            capacity: 512 * 1024 * 1024 * 1024,
            filesystem: "exfat".to_string(),
            mount_point: None,
        }])
    }
}

impl DeviceProbe for SimulatedProbe {
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        Ok(self.devices.clone())
    }
}
