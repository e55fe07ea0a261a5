//! Volume flattening and mount-result analysis.
//!
//! The collaborator reports container volumes (volume groups, encrypted
//! containers) with their contents nested inside. The catalog stores one flat
//! list per image: top-level volumes keep their position as ordinal, and
//! nested volumes are appended with the next unused ordinals, walking at most
//! two levels below the top.

use crate::types::{DetectedVolume, Disk, MountStatus, VolumeRecord};

/// What a single-disk mount attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DiskAnalysis {
    /// Flattened volume rows, ordered by ordinal
    pub volumes: Vec<VolumeRecord>,

    /// Set when any visited volume reports a clashing volume group.
    /// The name may be empty if the collaborator did not report one.
    pub duplicate_volume_group: Option<String>,

    /// Whether any volume anywhere in the tree is an encrypted container
    pub encrypted: bool,
}

impl DiskAnalysis {
    /// Whether at least one flattened volume obtained a mountpoint.
    pub fn any_mounted(&self) -> bool {
        self.volumes.iter().any(|v| v.mountpoint.is_some())
    }

    fn note_volume_group(&mut self, volume: &DetectedVolume) {
        if volume.duplicate_volume_group && self.duplicate_volume_group.is_none() {
            self.duplicate_volume_group = Some(volume.volume_group.clone().unwrap_or_default());
        }
    }
}

/// Flatten and inspect the volumes of `disk`.
///
/// Children of a mounted container are appended unconditionally. For an
/// unmounted container, only children and grandchildren that obtained a
/// mountpoint are appended.
pub(crate) fn analyze(disk: &Disk) -> DiskAnalysis {
    let mut analysis = DiskAnalysis {
        encrypted: disk.volumes.iter().any(tree_is_encrypted),
        ..Default::default()
    };

    let mut nested: Vec<&DetectedVolume> = Vec::new();

    for volume in &disk.volumes {
        analysis.note_volume_group(volume);

        if volume.has_mountpoint() {
            nested.extend(volume.volumes.iter());
            continue;
        }

        for child in &volume.volumes {
            analysis.note_volume_group(child);
            if child.has_mountpoint() {
                nested.push(child);
            }

            for grandchild in &child.volumes {
                analysis.note_volume_group(grandchild);
                if grandchild.has_mountpoint() {
                    nested.push(grandchild);
                }
            }
        }
    }

    // Children appended without inspection still count for the clash check
    for volume in &nested {
        analysis.note_volume_group(volume);
    }

    analysis.volumes = disk
        .volumes
        .iter()
        .chain(nested)
        .enumerate()
        .map(|(ordinal, volume)| to_record(ordinal as u32, volume))
        .collect();

    analysis
}

fn tree_is_encrypted(volume: &DetectedVolume) -> bool {
    volume.is_encrypted() || volume.volumes.iter().any(tree_is_encrypted)
}

fn to_record(ordinal: u32, volume: &DetectedVolume) -> VolumeRecord {
    let mountpoint = volume.mountpoint.clone().filter(|m| !m.is_empty());
    let status = if mountpoint.is_some() { MountStatus::Mounted } else { MountStatus::UnableToMount };

    VolumeRecord {
        partition_index: ordinal,
        status,
        mountpoint,
        size_bytes: Some(volume.size),
        offset_bytes: Some(volume.offset),
        fstype: volume.fstype.clone(),
        fsdescription: volume.fsdescription.clone(),
        label: volume.label.clone(),
    }
}
