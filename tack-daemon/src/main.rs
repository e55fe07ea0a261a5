use tack_core::observability::health::SUBSYSTEM_MOUNTER;
use tack_core::{
    init_observability, Catalog, Config, DirectoryReconciler, HealthChecker, MountService,
    MounterFactory,
};
use tracing::{error, info, warn};

mod monitor;
mod shutdown;
mod startup;

use monitor::DirectoryMonitor;
use shutdown::{shutdown_signal, ShutdownManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    config.validate()?;

    // Initialize observability before anything logs
    init_observability(&config.observability())?;

    info!("tack daemon starting");

    let health_checker = HealthChecker::with_standard_subsystems().await;

    info!("Opening catalog at {}", config.database.display());
    let catalog = Catalog::new(&config.database).await?;

    let mounter = match MounterFactory::create(&config.mounter) {
        Ok(mounter) => mounter,
        Err(e) => {
            error!("Failed to create mounter: {}", e);
            return Err(e.into());
        }
    };

    let service = MountService::new(catalog.clone(), mounter, config.mount_settings());

    match service.supported_tools().await {
        Ok(tools) => {
            let missing: Vec<_> =
                tools.iter().filter(|(_, found)| !**found).map(|(name, _)| name.as_str()).collect();
            info!(tools = ?tools, "Mounter {} available", config.mounter.program.display());
            if !missing.is_empty() {
                warn!("Missing helper tools: {}", missing.join(", "));
            }
        }
        Err(e) => {
            warn!("Could not query mounter tools: {}", e);
            health_checker.mark_degraded(SUBSYSTEM_MOUNTER, e.to_string()).await;
        }
    }

    startup::recover(&service, config.clean_stale_mounts).await?;

    let reconciler = DirectoryReconciler::new(
        catalog,
        &config.image_dir,
        config.skip_subdirectories.clone(),
        config.ignore_filter(),
    );
    let report = reconciler.reconcile().await?;
    info!("Catalogued {} images under {}", report.total, config.image_dir.display());

    let mut shutdown_rx = shutdown_signal();
    let monitor = DirectoryMonitor::new(reconciler, health_checker.clone(), config.reconcile_interval())
        .spawn(shutdown_rx.resubscribe());

    info!("tack daemon ready");

    let _ = shutdown_rx.recv().await;

    ShutdownManager::new(service, config.unmount_on_shutdown).shutdown(monitor).await?;

    info!("tack daemon shutting down");
    Ok(())
}
