//! Disk image domain types.

use crate::error::Result;
use crate::mounter::MountHandle;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Mount status of an image or volume.
///
/// Backed by the fixed `mount_status_codes` table; the discriminant is the
/// row id seeded by the first migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Mounted,
    UnableToMount,
    Unmounted,
    ManualMount,
}

impl MountStatus {
    /// All statuses in seed order.
    pub const ALL: [MountStatus; 4] =
        [Self::Mounted, Self::UnableToMount, Self::Unmounted, Self::ManualMount];

    /// Row id in `mount_status_codes`.
    pub fn code(self) -> i64 {
        match self {
            Self::Mounted => 1,
            Self::UnableToMount => 2,
            Self::Unmounted => 3,
            Self::ManualMount => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Human label stored in `mount_status_codes.status`.
    pub fn label(self) -> &'static str {
        match self {
            Self::Mounted => "Mounted",
            Self::UnableToMount => "Unable to mount",
            Self::Unmounted => "Unmounted",
            Self::ManualMount => "Manual mount",
        }
    }
}

impl std::fmt::Display for MountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle state of an image, derived from `(mount_status, ref_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Not mounted, ref_count 0.
    Unmounted,
    /// A mount attempt holds the `ref_count = 1` sentinel, status still Unmounted.
    MountInFlight,
    /// Mounted with at least one consumer.
    Mounted,
    /// The collaborator mounted some volumes but reported no disk-level
    /// mountpoint. Holds OS mounts that must be released like `Mounted`.
    PartiallyMounted,
    /// Mountpoint registered out-of-band.
    ManualMount,
    /// The last attempt failed, ref_count 0.
    UnableToMount,
}

impl ImageState {
    /// Whether the image currently exposes a mount that consumers can share.
    pub fn holds_mount(self) -> bool {
        matches!(self, Self::Mounted | Self::PartiallyMounted | Self::ManualMount)
    }
}

/// A disk image file catalogued under the watched directory.
#[derive(Debug, Clone)]
pub struct Image {
    /// Catalog row id
    pub id: i64,

    /// Absolute path (internal identity key)
    pub full_path: PathBuf,

    /// Path relative to the watched root (external identity key)
    pub rel_path: String,

    /// File name
    pub filename: String,

    /// Current mount status
    pub status: MountStatus,

    /// OS path where the primary disk is exposed
    pub mountpoint: Option<String>,

    /// Number of consumers depending on the mount
    pub ref_count: u32,

    /// Encoded [`MountHandle`], if the collaborator produced one
    pub mount_handle: Option<Vec<u8>>,
}

impl Image {
    pub fn state(&self) -> ImageState {
        match (self.status, self.ref_count) {
            (MountStatus::UnableToMount, 0) => ImageState::UnableToMount,
            (_, 0) => ImageState::Unmounted,
            (MountStatus::Unmounted, _) => ImageState::MountInFlight,
            (MountStatus::Mounted, _) => ImageState::Mounted,
            (MountStatus::UnableToMount, _) => ImageState::PartiallyMounted,
            (MountStatus::ManualMount, _) => ImageState::ManualMount,
        }
    }

    /// Decode the stored mount handle.
    pub fn handle(&self) -> Result<Option<MountHandle>> {
        self.mount_handle.as_deref().map(MountHandle::decode).transpose()
    }
}

/// Catalog listing entry for an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: i64,
    pub rel_path: String,
    pub full_path: PathBuf,
    pub filename: String,
    pub status: MountStatus,
    pub mountpoint: Option<String>,
    pub ref_count: u32,
    /// Volume details, only populated while the image holds a mount
    pub volumes: Vec<VolumeSummary>,
}

/// Per-volume entry of an [`ImageSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub index: u32,
    pub mountpoint: Option<String>,
    pub status: MountStatus,
    /// Identifier safe for use as an HTML element id
    pub uid: String,
}

impl VolumeSummary {
    /// Build the sanitized uid for a volume of `rel_path`.
    pub fn uid_for(rel_path: &str, index: u32) -> String {
        let sanitized = rel_path.replace('/', "_").replace(':', "-").replace('.', "-");
        format!("{}_{}", sanitized, index)
    }
}
