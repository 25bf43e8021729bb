use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A removable block device (or one of its partitions) that can serve as
/// the transfer source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub model: String,
    pub capacity: u64,
    pub filesystem: String,
    pub mount_point: Option<PathBuf>,
}

/// Supported filesystems for source drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Ext4,
    Exfat,
    Vfat,
    Ntfs,
    Hfsplus,
    Apfs,
}

impl SupportedFilesystem {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ext4" => Some(Self::Ext4),
            "exfat" => Some(Self::Exfat),
            "vfat" | "fat32" | "fat16" => Some(Self::Vfat),
            "ntfs" | "ntfs3" => Some(Self::Ntfs),
            "hfsplus" => Some(Self::Hfsplus),
            "apfs" => Some(Self::Apfs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Exfat => "exfat",
            Self::Vfat => "vfat",
            Self::Ntfs => "ntfs",
            Self::Hfsplus => "hfsplus",
            Self::Apfs => "apfs",
        }
    }
}

/// Lists removable devices currently attached to the appliance.
pub trait DeviceProbe: Send + Sync {
    /// List all currently connected USB devices that could be mounted.
    /// NOTE: may spawn a process; call from a blocking context.
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>>;
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    size: Option<serde_json::Value>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Parse `lsblk -J -b -o NAME,SIZE,TYPE,MOUNTPOINT,TRAN,MODEL,FSTYPE` output
/// into the USB partitions (or bare USB disks) it describes.
///
/// Only devices on the `usb` transport are considered. A disk with partitions
/// contributes its partitions; a disk without is offered whole.
pub fn parse_lsblk(json: &str) -> anyhow::Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut devices = Vec::new();

    for disk in output.blockdevices {
        let transport = disk.tran.as_deref().unwrap_or_default().to_lowercase();
        if transport != "usb" {
            continue;
        }

        let model = disk
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("USB Drive")
            .to_string();

        let targets: Vec<&LsblkDevice> = if disk.children.is_empty() {
            vec![&disk]
        } else {
            disk.children.iter().collect()
        };

        for part in targets {
            if !matches!(part.kind.as_deref(), Some("part") | Some("disk")) {
                continue;
            }
            devices.push(BlockDevice {
                path: PathBuf::from(format!("/dev/{}", part.name)),
                model: model.clone(),
                capacity: parse_size(part.size.as_ref()),
                filesystem: part.fstype.clone().unwrap_or_default(),
                mount_point: part.mountpoint.as_ref().map(PathBuf::from),
            });
        }
    }

    Ok(devices)
}

// lsblk emits sizes as numbers with -b, but older versions quote them
fn parse_size(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
