//! Disk mounter abstraction.
//!
//! Decoding image containers and mounting filesystems is delegated to an
//! external collaborator behind the `DiskMounter` trait. tack only decides
//! *when* to mount and tracks what the collaborator reports.

use crate::error::Result;
use crate::types::ParsedImage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

mod credentials;
mod factory;
mod handle;
mod imount;

pub use credentials::{Credentials, DecryptionKey, DecryptionMethod};
pub use factory::{MounterConfig, MounterFactory};
pub use handle::{MountHandle, HANDLE_VERSION};
pub use imount::ImountMounter;

/// Disk-mounting strategy used by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountBackend {
    /// Let the collaborator pick its preferred disk mounter
    Auto,
    /// Device emulation through qemu-nbd, used as the fallback strategy
    QemuNbd,
}

impl MountBackend {
    /// Backend to retry with when this one produced no mountable volumes.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Auto => Some(Self::QemuNbd),
            Self::QemuNbd => None,
        }
    }
}

impl std::fmt::Display for MountBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::QemuNbd => write!(f, "qemu-nbd"),
        }
    }
}

/// A single mount attempt.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// Image file(s) to mount; multi-segment sets are passed by first segment
    pub paths: Vec<PathBuf>,

    /// Directory under which the collaborator creates mountpoints
    pub mount_root: PathBuf,

    pub backend: MountBackend,

    pub credentials: Option<Credentials>,
}

/// Mounting collaborator trait.
///
/// Implementations must be safe to share across tasks, but tack never calls
/// them concurrently: every call happens under the orchestrator's mount lock.
#[async_trait]
pub trait DiskMounter: Send + Sync {
    /// Attempt to expose the image's volumes under `request.mount_root`.
    ///
    /// A result with zero disks, several disks, or no mounted volumes is not
    /// an error at this level; the orchestrator interprets it. Errors are
    /// reserved for the collaborator itself failing.
    async fn attempt_mount(&self, request: &MountRequest) -> Result<ParsedImage>;

    /// Release every OS mount recorded in `handle`.
    ///
    /// With `allow_lazy`, busy mounts are detached and torn down once idle
    /// instead of failing the release.
    async fn release(&self, handle: &MountHandle, allow_lazy: bool) -> Result<()>;

    /// Report which helper tools the collaborator found (true = installed).
    async fn supported_tools(&self) -> Result<BTreeMap<String, bool>>;

    /// Get mounter name (for logging/metrics).
    fn name(&self) -> &str;
}
