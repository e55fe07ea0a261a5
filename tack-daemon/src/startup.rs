//! Startup recovery for tackd.
//!
//! Handles state left behind when the daemon was killed without a clean
//! shutdown: interrupted mount attempts, and (optionally) stale mounts and
//! mountpoint directories under the mount root.

use std::path::Path;
use tack_core::{MountService, Result, TackError};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Report of startup cleanup actions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// In-flight sentinels reset
    pub interrupted: usize,
    /// Images force-unmounted
    pub unmounted: usize,
    /// Directories removed from the mount root
    pub removed_dirs: usize,
}

/// Recover catalog state, optionally tearing down stale mounts.
pub async fn recover(service: &MountService, clean_stale_mounts: bool) -> Result<StartupReport> {
    info!("Recovering catalog state...");

    let mut report = StartupReport {
        interrupted: service.recover_interrupted_mounts().await?,
        ..Default::default()
    };

    let mount_dir = service.settings().mount_dir.clone();
    tokio::fs::create_dir_all(&mount_dir)
        .await
        .map_err(|e| TackError::IoError { path: mount_dir.clone(), source: e })?;

    if clean_stale_mounts {
        let unmounted = service.unmount_all(true).await?;
        for (rel_path, reason) in &unmounted.failed {
            warn!("Stale mount of {} could not be released: {}", rel_path, reason);
        }
        report.unmounted = unmounted.released.len();
        report.removed_dirs = clean_mount_root(&mount_dir).await?;
    }

    info!(
        "Recovery complete: {} interrupted, {} unmounted, {} directories removed",
        report.interrupted, report.unmounted, report.removed_dirs
    );
    Ok(report)
}

/// Unmount and remove every directory directly under `mount_dir`.
///
/// Directories that are still busy or not empty are left in place.
pub async fn clean_mount_root(mount_dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(mount_dir)
        .await
        .map_err(|e| TackError::IoError { path: mount_dir.to_path_buf(), source: e })?;

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TackError::IoError { path: mount_dir.to_path_buf(), source: e })?
    {
        let path = entry.path();
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        match Command::new("umount").arg(&path).output().await {
            Ok(output) if output.status.success() => info!("Unmounted stale {}", path.display()),
            Ok(_) => debug!("{} was not mounted", path.display()),
            Err(e) => debug!("Could not run umount for {}: {}", path.display(), e),
        }

        match tokio::fs::remove_dir(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tack_core::{Catalog, MounterFactory, MountSettings, MountStatus};

    async fn service(dir: &Path) -> MountService {
        let catalog = Catalog::new_in_memory().await.unwrap();
        let mounter = MounterFactory::create(&Default::default()).unwrap();
        MountService::new(catalog, mounter, MountSettings { mount_dir: dir.join("mnt") })
    }

    #[tokio::test]
    async fn test_clean_mount_root_removes_empty_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b/busy")).unwrap();
        std::fs::write(dir.path().join("note.txt"), b"keep").unwrap();

        let removed = clean_mount_root(dir.path()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());
        assert!(dir.path().join("note.txt").exists());
    }

    #[tokio::test]
    async fn test_recover_resets_interrupted_and_manual_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let catalog = service.catalog();

        catalog.insert_image_if_absent(Path::new("/images/a.E01"), "a.E01", "a.E01").await.unwrap();
        catalog.insert_image_if_absent(Path::new("/images/b.E01"), "b.E01", "b.E01").await.unwrap();
        let a = catalog.get_image("a.E01").await.unwrap().unwrap().id;
        let b = catalog.get_image("b.E01").await.unwrap().unwrap().id;
        catalog.claim_mount(a).await.unwrap();
        catalog.record_manual_mount(b, "/srv/b").await.unwrap();

        std::fs::create_dir_all(dir.path().join("mnt/stale")).unwrap();

        let report = recover(&service, true).await.unwrap();
        assert_eq!(report, StartupReport { interrupted: 1, unmounted: 1, removed_dirs: 1 });

        let b = catalog.get_image_by_id(b).await.unwrap().unwrap();
        assert_eq!(b.status, MountStatus::Unmounted);
        assert_eq!(b.ref_count, 0);
        assert!(dir.path().join("mnt").is_dir());
    }

    #[tokio::test]
    async fn test_recover_without_cleanup_keeps_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let catalog = service.catalog();

        catalog.insert_image_if_absent(Path::new("/images/b.E01"), "b.E01", "b.E01").await.unwrap();
        let b = catalog.get_image("b.E01").await.unwrap().unwrap().id;
        catalog.record_manual_mount(b, "/srv/b").await.unwrap();

        let report = recover(&service, false).await.unwrap();
        assert_eq!(report, StartupReport::default());
        assert_eq!(catalog.get_image_by_id(b).await.unwrap().unwrap().ref_count, 1);
    }
}
