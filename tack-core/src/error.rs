//! Error types for tack.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Every mount-level condition is a distinct variant so that callers (and any
//! API layer built on top) can translate them into specific, human-readable
//! responses.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tack operations.
pub type Result<T> = std::result::Result<T, TackError>;

/// Main error type for tack.
#[derive(Error, Debug)]
pub enum TackError {
    // Catalog lookup errors
    #[error("Cannot mount {rel_path}. Image is not in the catalog")]
    NotInCatalog { rel_path: String },

    #[error("{path:?} is not a valid file or is not accessible for reading")]
    NotReadable { path: PathBuf },

    // Mount attempt errors
    #[error(
        "Unexpected number of disks in {rel_path} (expected 1, got {count}). \
         Only disk images that contain one disk are supported"
    )]
    UnexpectedDiskCount { rel_path: String, count: usize },

    #[error("No volumes in {rel_path} were able to be mounted")]
    NoMountableVolumes { rel_path: String },

    #[error("Encrypted volume detected in {rel_path}. {reason}")]
    EncryptedImage { rel_path: String, reason: String },

    #[error("Mount attempt already in progress for {rel_path}. Retry later")]
    DuplicateMountInProgress { rel_path: String },

    #[error(
        "Duplicate volume group {volume_group} detected in {rel_path}. \
         Deactivate the volume group and retry the mount"
    )]
    DuplicateVolumeGroup { rel_path: String, volume_group: String },

    #[error("Mounter {mounter} failed: {reason}")]
    MounterFailed { mounter: String, reason: String },

    #[error("Failed to unmount {rel_path}: {reason}")]
    UnmountFailed { rel_path: String, reason: String },

    #[error("Invalid mountpoint {path:?}: {reason}")]
    InvalidMountpoint { path: PathBuf, reason: String },

    #[error("Invalid mount handle: {reason}")]
    InvalidHandle { reason: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TackError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether the caller may succeed by simply retrying later.
    ///
    /// `NotInCatalog` clears once the reconciler has seen the file, and
    /// `DuplicateMountInProgress` clears once the competing attempt finishes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotInCatalog { .. } | Self::DuplicateMountInProgress { .. })
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInCatalog { .. } => "not_in_catalog",
            Self::NotReadable { .. } => "not_readable",
            Self::UnexpectedDiskCount { .. } => "unexpected_disk_count",
            Self::NoMountableVolumes { .. } => "no_mountable_volumes",
            Self::EncryptedImage { .. } => "encrypted_image",
            Self::DuplicateMountInProgress { .. } => "duplicate_mount_in_progress",
            Self::DuplicateVolumeGroup { .. } => "duplicate_volume_group",
            Self::MounterFailed { .. } => "mounter_failed",
            Self::UnmountFailed { .. } => "unmount_failed",
            Self::InvalidMountpoint { .. } => "invalid_mountpoint",
            Self::InvalidHandle { .. } => "invalid_handle",
            Self::DatabaseError(_) => "database",
            Self::MigrationFailed { .. } => "migration",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::IoError { .. } => "io",
            Self::Internal(_) | Self::Other(_) => "internal",
        }
    }
}
