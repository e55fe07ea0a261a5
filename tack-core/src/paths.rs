//! Centralized path configuration for tack.
//!
//! All default locations go through this module so the daemon and any tool
//! built on the library agree, whether running as a user or a system service.

use std::path::PathBuf;

/// Get the tack data directory.
///
/// Resolution order:
/// 1. `TACK_DATA_DIR` environment variable
/// 2. `/var/lib/tack` if it exists (system install)
/// 3. `~/.tack` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TACK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/tack");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".tack")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `TACK_CONFIG_DIR`, then the platform config directory, then the data directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TACK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("tack")).unwrap_or_else(data_dir)
}

/// Get the default catalog database path.
pub fn db_path() -> PathBuf {
    data_dir().join("tack.db")
}

/// Get the default mount root.
pub fn mount_dir() -> PathBuf {
    data_dir().join("mounts")
}
