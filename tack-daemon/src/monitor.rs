//! Periodic directory monitoring for tackd.
//!
//! Re-runs the directory reconciler on a fixed interval until shutdown, and
//! reports its outcome to the health checker.

use std::time::Duration;
use tack_core::observability::health::SUBSYSTEM_MONITOR;
use tack_core::{DirectoryReconciler, HealthChecker};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Background reconciliation task.
pub struct DirectoryMonitor {
    reconciler: DirectoryReconciler,
    health: HealthChecker,
    interval: Duration,
}

impl DirectoryMonitor {
    pub fn new(reconciler: DirectoryReconciler, health: HealthChecker, interval: Duration) -> Self {
        Self { reconciler, health, interval }
    }

    /// Run a single reconciliation pass. Returns true on success.
    pub async fn run_once(&self) -> bool {
        match self.reconciler.reconcile().await {
            Ok(_) => {
                self.health.mark_healthy(SUBSYSTEM_MONITOR).await;
                true
            }
            Err(e) => {
                warn!("Reconciliation of {} failed: {}", self.reconciler.image_dir().display(), e);
                self.health.mark_degraded(SUBSYSTEM_MONITOR, e.to_string()).await;
                false
            }
        }
    }

    /// Spawn the monitor loop; it exits when `shutdown` fires.
    ///
    /// The first pass runs one interval after spawning.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!("Directory monitor started (every {:?})", self.interval);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Directory monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
