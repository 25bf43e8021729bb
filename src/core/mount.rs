//! Mount lifecycle for the source drive and the destination share.
//!
//! [`MountManager`] owns every [`Volume`] the appliance uses. Callers get a
//! [`MountedVolume`] handle carrying the resolved local path and hand it back
//! to [`MountManager::release`] when done. The actual mount syscalls live
//! behind [`MountBackend`] so the lifecycle rules can run against a
//! simulated backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    MountFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountErrorKind {
    Unreachable,
    AuthFailed,
    Busy,
    NotFound,
}

impl MountErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::AuthFailed => "auth_failed",
            Self::Busy => "busy",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} ({}): {message}", .kind.as_str(), .target.display())]
pub struct MountError {
    pub kind: MountErrorKind,
    pub target: PathBuf,
    pub message: String,
}

impl MountError {
    pub fn new(kind: MountErrorKind, target: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// What to mount. The variant decides which options are forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSpec {
    Source(SourceSpec),
    Destination(DestinationSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    /// Extra mount options. `ro` is always added.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    pub primary_address: String,
    pub secondary_address: Option<String>,
    pub share: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_version: String,
    pub mount_point: PathBuf,
}

impl VolumeSpec {
    pub fn kind(&self) -> VolumeKind {
        match self {
            Self::Source(_) => VolumeKind::Source,
            Self::Destination(_) => VolumeKind::Destination,
        }
    }

    pub fn mount_point(&self) -> &Path {
        match self {
            Self::Source(s) => &s.mount_point,
            Self::Destination(d) => &d.mount_point,
        }
    }
}

/// A single invocation of the backend's mount primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device path or `//address/share`
    pub source: String,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub options: Vec<String>,
    /// Passed out of band (never in `options`) so it stays out of argv
    pub password: Option<String>,
}

impl SourceSpec {
    fn request(&self) -> MountRequest {
        let mut options: Vec<String> = self
            .options
            .iter()
            .filter(|o| o.as_str() != "rw" && o.as_str() != "ro")
            .cloned()
            .collect();
        options.insert(0, "ro".to_string());

        MountRequest {
            source: self.device.display().to_string(),
            target: self.mount_point.clone(),
            fstype: None,
            options,
            password: None,
        }
    }
}

impl DestinationSpec {
    pub fn unc(&self, address: &str) -> String {
        format!("//{}/{}", address, self.share)
    }

    fn request(&self, address: &str) -> MountRequest {
        let mut options = vec![format!("vers={}", self.protocol_version)];
        match self.username.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => options.push(format!("username={}", user)),
            None => options.push("guest".to_string()),
        }
        options.extend(
            ["uid=0", "gid=0", "file_mode=0777", "dir_mode=0777"]
                .into_iter()
                .map(String::from),
        );

        MountRequest {
            source: self.unc(address),
            target: self.mount_point.clone(),
            fstype: Some("cifs".to_string()),
            options,
            password: self.password.clone().filter(|p| !p.is_empty()),
        }
    }

    fn addresses(&self) -> Vec<&str> {
        let mut addresses = vec![self.primary_address.as_str()];
        if let Some(secondary) = self.secondary_address.as_deref() {
            if !secondary.is_empty() && secondary != self.primary_address {
                addresses.push(secondary);
            }
        }
        addresses
    }
}

/// Platform mount primitives.
#[async_trait]
pub trait MountBackend: Send + Sync {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError>;

    /// Detach whatever is mounted at `mount_point`. `force` is used to clear a
    /// stale mount left behind by an earlier run.
    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), MountError>;

    async fn is_mounted(&self, mount_point: &Path) -> bool;
}

/// Handle to an acquired volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedVolume {
    pub kind: VolumeKind,
    pub mount_point: PathBuf,
    /// What was mounted (device path or `//address/share`)
    pub source: String,
    /// Address actually used for a destination share
    pub address: Option<String>,
}

/// Book-keeping for one mount point.
#[derive(Debug, Clone)]
pub struct Volume {
    pub kind: VolumeKind,
    pub mount_point: PathBuf,
    pub request: Option<MountRequest>,
    pub address: Option<String>,
    pub state: MountState,
}

/// Retry policy for the source drive.
#[derive(Debug, Clone, Copy)]
pub struct SourceRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for SourceRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1500),
        }
    }
}

pub struct MountManager {
    backend: std::sync::Arc<dyn MountBackend>,
    // Held across a whole acquire/release so mount operations never interleave
    volumes: Mutex<HashMap<PathBuf, Volume>>,
}

impl MountManager {
    pub fn new(backend: std::sync::Arc<dyn MountBackend>) -> Self {
        Self {
            backend,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of the volume at `mount_point`, if it was ever acquired.
    pub async fn volume(&self, mount_point: &Path) -> Option<Volume> {
        self.volumes.lock().await.get(mount_point).cloned()
    }

    pub async fn acquire(&self, spec: &VolumeSpec, retry: SourceRetry) -> Result<MountedVolume, MountError> {
        let mut volumes = self.volumes.lock().await;
        let kind = spec.kind();
        let mount_point = spec.mount_point().to_path_buf();

        let candidates: Vec<(MountRequest, Option<String>)> = match spec {
            VolumeSpec::Source(source) => vec![(source.request(), None)],
            VolumeSpec::Destination(dest) => dest
                .addresses()
                .into_iter()
                .map(|addr| (dest.request(addr), Some(addr.to_string())))
                .collect(),
        };

        // Already mounted with one of the acceptable parameter sets
        if let Some(existing) = volumes.get(&mount_point) {
            if existing.state == MountState::Mounted && existing.kind == kind {
                if let Some(current) = &existing.request {
                    let matches = candidates.iter().any(|(req, _)| req == current);
                    if matches && self.backend.is_mounted(&mount_point).await {
                        debug!(mount_point = %mount_point.display(), "Volume already mounted, reusing");
                        return Ok(MountedVolume {
                            kind,
                            mount_point,
                            source: current.source.clone(),
                            address: existing.address.clone(),
                        });
                    }
                }
            }
        }

        let entry = volumes.entry(mount_point.clone()).or_insert_with(|| Volume {
            kind,
            mount_point: mount_point.clone(),
            request: None,
            address: None,
            state: MountState::Unmounted,
        });

        // Parameters changed since the last mount: detach before remounting
        if entry.state == MountState::Mounted {
            if let Err(e) = self.backend.unmount(&mount_point, false).await {
                debug!(error = %e, "Previous mount already gone");
            }
        }

        entry.kind = kind;
        entry.state = MountState::Mounting;

        let attempts = match kind {
            VolumeKind::Source => retry.attempts.max(1),
            VolumeKind::Destination => 1,
        };

        let mut last_error = None;
        'candidates: for (request, address) in &candidates {
            for attempt in 1..=attempts {
                match self.mount_clearing_busy(request).await {
                    Ok(()) => {
                        info!(
                            source = %request.source,
                            mount_point = %mount_point.display(),
                            "Volume mounted"
                        );
                        entry.request = Some(request.clone());
                        entry.address = address.clone();
                        entry.state = MountState::Mounted;
                        return Ok(MountedVolume {
                            kind,
                            mount_point,
                            source: request.source.clone(),
                            address: address.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(
                            source = %request.source,
                            attempt,
                            error = %e,
                            "Mount attempt failed"
                        );
                        let kind = e.kind;
                        last_error = Some(e);

                        match kind {
                            // Wrong credentials will not work on another address either
                            MountErrorKind::AuthFailed => break 'candidates,
                            MountErrorKind::Unreachable => {
                                if attempt < attempts {
                                    tokio::time::sleep(retry.delay).await;
                                    continue;
                                }
                                continue 'candidates;
                            }
                            MountErrorKind::NotFound if attempt < attempts => {
                                tokio::time::sleep(retry.delay).await;
                            }
                            _ => break 'candidates,
                        }
                    }
                }
            }
        }

        entry.state = MountState::MountFailed;
        Err(last_error.unwrap_or_else(|| {
            MountError::new(MountErrorKind::NotFound, &mount_point, "no mount candidates")
        }))
    }

    /// Mount once; a `busy` mount point is force-detached and retried a single time.
    async fn mount_clearing_busy(&self, request: &MountRequest) -> Result<(), MountError> {
        match self.backend.mount(request).await {
            Err(e) if e.kind == MountErrorKind::Busy => {
                warn!(
                    mount_point = %request.target.display(),
                    "Mount point busy, forcing unmount and retrying"
                );
                if let Err(e) = self.backend.unmount(&request.target, true).await {
                    debug!(error = %e, "Forced unmount reported an error");
                }
                self.backend.mount(request).await
            }
            other => other,
        }
    }

    /// Release a volume. Never fails: a resource that already disappeared
    /// (drive unplugged, share dropped) counts as released.
    pub async fn release(&self, handle: &MountedVolume) {
        let mut volumes = self.volumes.lock().await;

        if let Some(volume) = volumes.get(&handle.mount_point) {
            if volume.state == MountState::Unmounted {
                debug!(mount_point = %handle.mount_point.display(), "Volume already released");
                return;
            }
        }

        match self.backend.unmount(&handle.mount_point, false).await {
            Ok(()) => info!(mount_point = %handle.mount_point.display(), "Volume released"),
            Err(e) => warn!(
                mount_point = %handle.mount_point.display(),
                error = %e,
                "Volume was already detached"
            ),
        }

        if let Some(volume) = volumes.get_mut(&handle.mount_point) {
            volume.state = MountState::Unmounted;
            volume.request = None;
        }
    }
}
