use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use regex::Regex;
use tracing::debug;

use crate::core::hardware::{BlockDevice, DeviceProbe, parse_lsblk};
use crate::core::mount::{MountBackend, MountError, MountErrorKind, MountRequest};

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNTS_TABLE: &str = "/proc/self/mounts";

// mount.cifs reports the kernel errno as "mount error(13): Permission denied"
static MOUNT_ERRNO: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"mount error\((\d+)\)").ok());

/// Mounts through the system `mount` binary and detaches with `umount2`.
pub struct SystemMountBackend;

#[async_trait]
impl MountBackend for SystemMountBackend {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        tokio::fs::create_dir_all(&request.target)
            .await
            .map_err(|e| {
                MountError::new(
                    MountErrorKind::NotFound,
                    &request.target,
                    format!("cannot create mount point: {}", e),
                )
            })?;

        let mut cmd = tokio::process::Command::new("mount");
        if let Some(fstype) = &request.fstype {
            cmd.arg("-t").arg(fstype);
        }
        if !request.options.is_empty() {
            cmd.arg("-o").arg(request.options.join(","));
        }
        cmd.arg(&request.source).arg(&request.target);
        // mount.cifs reads the password from the environment, keeping it out of argv
        if let Some(password) = &request.password {
            cmd.env("PASSWD", password);
        }

        debug!(source = %request.source, target = %request.target.display(), "Running mount");
        let output = output_with_timeout(cmd, MOUNT_TIMEOUT)
            .await
            .map_err(|e| {
                MountError::new(
                    MountErrorKind::NotFound,
                    &request.target,
                    format!("failed to run mount: {}", e),
                )
            })?
            .ok_or_else(|| {
                MountError::new(MountErrorKind::Unreachable, &request.target, "mount timed out")
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(MountError::new(
            classify_mount_failure(&stderr),
            &request.target,
            stderr,
        ))
    }

    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), MountError> {
        let point = mount_point.to_path_buf();
        let mut flags = MntFlags::MNT_DETACH;
        if force {
            flags |= MntFlags::MNT_FORCE;
        }

        let result = tokio::task::spawn_blocking(move || umount2(&point, flags))
            .await
            .map_err(|e| {
                MountError::new(MountErrorKind::Busy, mount_point, format!("unmount task failed: {}", e))
            })?;

        result.map_err(|errno| {
            let kind = match errno {
                Errno::EINVAL | Errno::ENOENT => MountErrorKind::NotFound,
                Errno::EBUSY => MountErrorKind::Busy,
                Errno::EPERM | Errno::EACCES => MountErrorKind::AuthFailed,
                _ => MountErrorKind::Unreachable,
            };
            MountError::new(kind, mount_point, errno.desc())
        })
    }

    async fn is_mounted(&self, mount_point: &Path) -> bool {
        match tokio::fs::read_to_string(MOUNTS_TABLE).await {
            Ok(table) => mount_points(&table).any(|p| p == mount_point),
            Err(e) => {
                debug!(error = %e, "Failed to read mount table");
                false
            }
        }
    }
}

/// Run `cmd` to completion, or kill it once `limit` passes. `None` means it
/// timed out.
pub(crate) async fn output_with_timeout(
    mut cmd: tokio::process::Command,
    limit: Duration,
) -> io::Result<Option<Output>> {
    // A hung mount.cifs must not outlive the timeout
    cmd.kill_on_drop(true);
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

/// Map `mount` stderr onto a [`MountErrorKind`], preferring the kernel errno
/// when the helper reports one.
pub(crate) fn classify_mount_failure(stderr: &str) -> MountErrorKind {
    let errno = MOUNT_ERRNO
        .as_ref()
        .and_then(|re| re.captures(stderr))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok());

    if let Some(errno) = errno {
        match errno {
            libc::EACCES | libc::EPERM | libc::EKEYEXPIRED => return MountErrorKind::AuthFailed,
            libc::EBUSY => return MountErrorKind::Busy,
            libc::ENOENT | libc::ENXIO | libc::ENODEV | libc::ENOTBLK => {
                return MountErrorKind::NotFound;
            }
            libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::ECONNREFUSED
            | libc::ETIMEDOUT
            | libc::ENETUNREACH => return MountErrorKind::Unreachable,
            _ => {}
        }
    }

    let text = stderr.to_lowercase();
    if text.contains("permission denied")
        || text.contains("logon failure")
        || text.contains("access denied")
    {
        MountErrorKind::AuthFailed
    } else if text.contains("busy") || text.contains("already mounted") {
        MountErrorKind::Busy
    } else if text.contains("does not exist")
        || text.contains("no such file")
        || text.contains("special device")
        || text.contains("can't find")
    {
        MountErrorKind::NotFound
    } else {
        MountErrorKind::Unreachable
    }
}

/// Mount points listed in a `/proc/self/mounts` table.
pub(crate) fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

// Spaces, tabs, newlines and backslashes are written as octal escapes
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = field
                .get(i + 1..i + 4)
                .and_then(|octal| u8::from_str_radix(octal, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lists USB block devices with `lsblk`.
pub struct LsblkProbe;

impl DeviceProbe for LsblkProbe {
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        let output = Command::new("lsblk")
            .args(["-J", "-b", "-o", "NAME,SIZE,TYPE,MOUNTPOINT,TRAN,MODEL,FSTYPE"])
            .output()
            .context("Failed to run lsblk")?;

        if !output.status.success() {
            bail!(
                "lsblk exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }
}
