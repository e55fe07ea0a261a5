//! Graceful shutdown handling for tackd.
//!
//! Stops the directory monitor and, when configured, releases every mount the
//! catalog knows about before the daemon exits.

use tack_core::{MountService, Result, UnmountReport};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    service: MountService,
    unmount_on_shutdown: bool,
}

impl ShutdownManager {
    pub fn new(service: MountService, unmount_on_shutdown: bool) -> Self {
        Self { service, unmount_on_shutdown }
    }

    /// Join the monitor task, then tear down mounts.
    ///
    /// The monitor is expected to have been signalled already. Unmounting is
    /// forced so consumers that never released do not keep images mounted
    /// past the daemon's lifetime.
    pub async fn shutdown(&self, monitor: JoinHandle<()>) -> Result<Option<UnmountReport>> {
        info!("Starting graceful shutdown...");

        if let Err(e) = monitor.await {
            warn!("Directory monitor did not stop cleanly: {}", e);
        }

        if !self.unmount_on_shutdown {
            info!("Leaving mounts in place");
            return Ok(None);
        }

        let report = self.service.unmount_all(true).await?;
        for (rel_path, reason) in &report.failed {
            error!("Could not unmount {} during shutdown: {}", rel_path, reason);
        }

        info!("Graceful shutdown complete");
        Ok(Some(report))
    }
}

/// Create a shutdown signal receiver.
///
/// Returns a broadcast receiver that will receive a signal when
/// SIGTERM or SIGINT is received.
pub fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = tx.send(());
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tack_core::{Catalog, MounterFactory, MountSettings};

    async fn service_with_manual_mount(dir: &Path) -> MountService {
        let catalog = Catalog::new_in_memory().await.unwrap();
        catalog.insert_image_if_absent(Path::new("/images/a.E01"), "a.E01", "a.E01").await.unwrap();

        let mounter = MounterFactory::create(&Default::default()).unwrap();
        let service =
            MountService::new(catalog, mounter, MountSettings { mount_dir: dir.join("mnt") });

        let mountpoint = dir.join("manual");
        std::fs::create_dir_all(&mountpoint).unwrap();
        assert!(service.register_manual_mount("a.E01", &mountpoint).await.unwrap());
        service
    }

    #[tokio::test]
    async fn test_shutdown_releases_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_manual_mount(dir.path()).await;
        let manager = ShutdownManager::new(service.clone(), true);

        let report = manager.shutdown(tokio::spawn(async {})).await.unwrap().unwrap();
        assert_eq!(report.released, vec!["a.E01"]);
        assert!(service.list_mounted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_can_leave_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_manual_mount(dir.path()).await;
        let manager = ShutdownManager::new(service.clone(), false);

        assert!(manager.shutdown(tokio::spawn(async {})).await.unwrap().is_none());
        assert_eq!(service.list_mounted().await.unwrap().len(), 1);
    }
}
