//! Volume domain types.

use crate::types::disk::VolumeView;
use crate::types::image::MountStatus;
use serde::{Deserialize, Serialize};

/// Catalog row for a volume of an image.
///
/// Nested volumes are flattened into the same table; `partition_index` is the
/// synthetic ordinal assigned during flattening, not the on-disk partition
/// number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub partition_index: u32,
    pub status: MountStatus,
    pub mountpoint: Option<String>,
    pub size_bytes: Option<u64>,
    pub offset_bytes: Option<u64>,
    pub fstype: Option<String>,
    pub fsdescription: Option<String>,
    pub label: Option<String>,
}

impl VolumeRecord {
    /// Placeholder row for a manually registered mountpoint.
    pub fn manual(mountpoint: &str) -> Self {
        Self {
            partition_index: 0,
            status: MountStatus::ManualMount,
            mountpoint: Some(mountpoint.to_string()),
            size_bytes: None,
            offset_bytes: None,
            fstype: None,
            fsdescription: None,
            label: None,
        }
    }

    pub fn to_view(&self) -> VolumeView {
        VolumeView {
            index: self.partition_index,
            size: self.size_bytes,
            offset: self.offset_bytes,
            label: self.label.clone(),
            fsdescription: self.fsdescription.clone(),
            fstype: self.fstype.clone(),
            mountpoint: self.mountpoint.clone(),
            status: self.status,
        }
    }
}
