//! tack core library
//!
//! Catalog, directory reconciliation and ref-counted mount orchestration for
//! forensic disk images. Decoding images and mounting filesystems is left to
//! an external collaborator behind [`mounter::DiskMounter`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod filter;
pub mod mounter;
pub mod mounts;
pub mod observability;
pub mod paths;
pub mod reconcile;
pub mod types;

// Re-export commonly used items
pub use catalog::Catalog;
pub use config::Config;
pub use error::{Result, TackError};
pub use filter::IgnoreFilter;
pub use mounter::{Credentials, DiskMounter, MountBackend, MounterFactory};
pub use mounts::{MountService, MountSettings, UnmountReport};
pub use observability::{health::HealthChecker, init as init_observability, ObservabilityConfig};
pub use reconcile::{DirectoryReconciler, ReconcileReport};
pub use types::{DiskView, Image, ImageState, ImageSummary, MountInfo, MountStatus, VolumeView};
