//! Serialized mount handle.
//!
//! Stored per image so that a later unmount (possibly from another process
//! after a restart) can ask the collaborator to release exactly what it
//! mounted. Only the fields `release` needs are kept. A handle without
//! mountpoints still identifies the attempt: the collaborator finds any
//! devices it attached from the image paths and backend.

use crate::error::{Result, TackError};
use crate::mounter::{MountBackend, MountRequest};
use crate::types::ParsedImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current handle format version.
pub const HANDLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountHandle {
    pub version: u32,
    pub paths: Vec<PathBuf>,
    pub backend: MountBackend,
    pub mount_root: PathBuf,
    pub disk_mountpoint: Option<String>,
    /// Volume mountpoints, in the order they were created
    pub volume_mountpoints: Vec<String>,
}

impl MountHandle {
    /// Build the handle for everything a mount attempt produced.
    pub fn from_attempt(request: &MountRequest, parsed: &ParsedImage) -> Self {
        let disk_mountpoint = parsed.disks.first().and_then(|d| d.mountpoint.clone());
        let volume_mountpoints = parsed
            .mountpoints()
            .into_iter()
            .filter(|m| Some(m) != disk_mountpoint.as_ref())
            .collect();

        Self {
            version: HANDLE_VERSION,
            paths: request.paths.clone(),
            backend: request.backend,
            mount_root: request.mount_root.clone(),
            disk_mountpoint,
            volume_mountpoints,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TackError::InvalidHandle { reason: format!("Failed to encode: {}", e) })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Versioned {
            version: u32,
        }

        let Versioned { version } = serde_json::from_slice(bytes)
            .map_err(|e| TackError::InvalidHandle { reason: format!("Failed to decode: {}", e) })?;

        if version != HANDLE_VERSION {
            return Err(TackError::InvalidHandle {
                reason: format!("Unsupported handle version {} (expected {})", version, HANDLE_VERSION),
            });
        }

        serde_json::from_slice(bytes)
            .map_err(|e| TackError::InvalidHandle { reason: format!("Failed to decode: {}", e) })
    }
}
