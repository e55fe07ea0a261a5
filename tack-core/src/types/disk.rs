//! Disk and volume trees.
//!
//! [`ParsedImage`] is what the external mounting collaborator reports for a
//! mount attempt. [`DiskView`] is what tack hands back to its callers; it is
//! rebuilt from the catalog so that reads never touch the collaborator.

use crate::types::image::MountStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of a mount attempt: zero or more disks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedImage {
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl ParsedImage {
    /// Every mountpoint the attempt produced, disk-level first.
    pub fn mountpoints(&self) -> Vec<String> {
        let mut out = Vec::new();
        for disk in &self.disks {
            out.extend(disk.mountpoint.iter().cloned());
            for volume in &disk.volumes {
                volume.collect_mountpoints(&mut out);
            }
        }
        out
    }
}

/// A logical disk exposed by the collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Disk {
    /// Image file(s) backing this disk
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Disk-level mountpoint (where the raw disk is exposed)
    #[serde(default)]
    pub mountpoint: Option<String>,

    /// Top-level volumes; container volumes carry nested volumes
    #[serde(default)]
    pub volumes: Vec<DetectedVolume>,
}

/// A volume found inside a disk, possibly a container of further volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectedVolume {
    pub size: u64,
    pub offset: u64,
    pub fstype: Option<String>,
    pub fsdescription: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,

    /// Volume group name, for LVM members and logical volumes
    pub volume_group: Option<String>,

    /// Set by the collaborator when the volume group name clashes with one
    /// already active on the host
    pub duplicate_volume_group: bool,

    /// Nested volumes (e.g. logical volumes inside a volume group)
    pub volumes: Vec<DetectedVolume>,
}

impl DetectedVolume {
    /// Whether this volume is an encrypted container (LUKS, BitLocker).
    pub fn is_encrypted(&self) -> bool {
        let fstype = self.fstype.as_deref().unwrap_or_default().to_ascii_lowercase();
        let description = self.fsdescription.as_deref().unwrap_or_default();
        matches!(fstype.as_str(), "luks" | "bde" | "bitlocker")
            || description.contains("LUKS encrypted")
            || description.contains("BitLocker")
    }

    pub fn has_mountpoint(&self) -> bool {
        self.mountpoint.as_deref().is_some_and(|m| !m.is_empty())
    }

    fn collect_mountpoints(&self, out: &mut Vec<String>) {
        if self.has_mountpoint() {
            out.extend(self.mountpoint.iter().cloned());
        }
        for child in &self.volumes {
            child.collect_mountpoints(out);
        }
    }
}

/// A mounted disk as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskView {
    /// Absolute path of the image file
    pub imagepath: PathBuf,

    pub mountpoint: Option<String>,

    pub volumes: Vec<VolumeView>,
}

/// A volume as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeView {
    pub index: u32,
    pub size: Option<u64>,
    pub offset: Option<u64>,
    pub label: Option<String>,
    pub fsdescription: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub status: MountStatus,
}

/// A mounted disk together with its consumer count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub disk: DiskView,
    pub ref_count: u32,
}
