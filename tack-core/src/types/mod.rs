//! Core domain types for tack.

pub mod disk;
pub mod image;
pub mod volume;

// Re-exports
pub use disk::{DetectedVolume, Disk, DiskView, MountInfo, ParsedImage, VolumeView};
pub use image::{Image, ImageState, ImageSummary, MountStatus, VolumeSummary};
pub use volume::VolumeRecord;
