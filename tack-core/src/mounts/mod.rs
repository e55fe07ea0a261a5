//! Mount orchestration.
//!
//! `MountService` owns the ref-counted mount lifecycle of catalogued images:
//! - mount with a fallback backend, nested-volume flattening and
//!   encrypted/duplicate-volume-group detection
//! - shared mounts through ref-counting, with the OS mount released by the
//!   last consumer (or by force)
//! - manual registration of mountpoints established out-of-band
//!
//! Every state transition runs under one service-wide mount lock, held across
//! the collaborator call. A mount attempt first claims the image with the
//! in-flight sentinel (`ref_count = 1`, status Unmounted) through an atomic
//! compare-and-set, so a second request for the same image fails fast with
//! `DuplicateMountInProgress` instead of queueing behind the lock.

use crate::catalog::Catalog;
use crate::error::{Result, TackError};
use crate::mounter::{Credentials, DiskMounter, MountBackend, MountHandle, MountRequest};
use crate::types::{
    DiskView, Image, ImageState, ImageSummary, MountInfo, MountStatus, ParsedImage, VolumeSummary,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn, Instrument};

mod flatten;

#[cfg(test)]
mod tests;

use flatten::DiskAnalysis;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct MountSettings {
    /// Root under which the collaborator creates mountpoints
    pub mount_dir: PathBuf,
}

/// Outcome of a bulk unmount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountReport {
    /// Images whose OS mount was released
    pub released: Vec<String>,
    /// Images that only dropped one consumer
    pub still_referenced: Vec<String>,
    /// Images that could not be unmounted, with the reason
    pub failed: Vec<(String, String)>,
}

/// How a mount request entered the lifecycle.
enum MountEntry<'a> {
    /// Added a consumer to an image that already holds a mount
    Shared(MountInfo),
    /// Placed the in-flight sentinel; the mount lock is held
    Claimed(MutexGuard<'a, ()>),
}

/// A completed collaborator attempt that produced exactly one disk.
struct MountOutcome {
    parsed: ParsedImage,
    handle: MountHandle,
    analysis: DiskAnalysis,
}

/// Ref-counted mount orchestrator and manual mount registrar.
#[derive(Clone)]
pub struct MountService {
    catalog: Catalog,
    mounter: Arc<dyn DiskMounter>,
    settings: Arc<MountSettings>,
    lock: Arc<Mutex<()>>,
}

impl MountService {
    pub fn new(catalog: Catalog, mounter: Arc<dyn DiskMounter>, settings: MountSettings) -> Self {
        Self { catalog, mounter, settings: Arc::new(settings), lock: Arc::new(Mutex::new(())) }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    // ========================
    // Mount
    // ========================

    /// Mount an image, or add a consumer to its existing mount.
    ///
    /// Credentials are ignored when the image is already mounted.
    ///
    /// The attempt runs on its own task, so dropping the returned future (a
    /// caller-side timeout) never strands the in-flight sentinel: the attempt
    /// still completes or rolls back, and a mount it completes holds one
    /// consumer that `unmount` releases.
    #[instrument(skip(self, credentials))]
    pub async fn mount(&self, rel_path: &str, credentials: Option<Credentials>) -> Result<MountInfo> {
        let started = Instant::now();

        let service = self.clone();
        let owned_path = rel_path.to_string();
        let task = tokio::spawn(
            async move { service.mount_inner(&owned_path, credentials).await }.in_current_span(),
        );
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(TackError::internal(e)),
        };

        match &result {
            Ok(_) => {
                metrics::histogram!("tack_mount_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                metrics::counter!("tack_mount_failures_total", "reason" => e.kind()).increment(1);
            }
        }

        result
    }

    async fn mount_inner(&self, rel_path: &str, credentials: Option<Credentials>) -> Result<MountInfo> {
        if self.settings.mount_dir.as_os_str().is_empty() {
            return Err(TackError::InvalidConfig {
                reason: "Mount directory is not set".to_string(),
            });
        }

        let image = self.lookup(rel_path).await?;
        check_readable(&image.full_path).await?;

        let _guard = match self.begin_mount(&image).await? {
            MountEntry::Shared(info) => return Ok(info),
            MountEntry::Claimed(guard) => guard,
        };

        info!("Mounting {}", rel_path);

        let outcome = match self.attempt(&image, credentials.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to mount {}: {}", rel_path, e);
                self.abandon(image.id, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.persist(image.id, &outcome).await {
            error!("Failed to record mount of {}: {}", rel_path, e);
            self.release_quietly(&outcome.handle).await;
            self.abandon(image.id, &e).await;
            return Err(e);
        }

        metrics::counter!("tack_mounts_total").increment(1);

        if let Some(volume_group) = &outcome.analysis.duplicate_volume_group {
            warn!("Duplicate volume group detected in {}: {:?}", rel_path, volume_group);
            return Err(TackError::DuplicateVolumeGroup {
                rel_path: rel_path.to_string(),
                volume_group: volume_group.clone(),
            });
        }

        info!(
            "Mounted {} at {}",
            rel_path,
            outcome.parsed.disks[0].mountpoint.as_deref().unwrap_or("<no disk mountpoint>")
        );
        self.mount_info(image.id, rel_path).await
    }

    /// Join an existing mount or claim the image for a new attempt.
    ///
    /// `image` is a snapshot read without the lock; either branch re-checks
    /// the catalog, since a concurrent mount or unmount may have completed
    /// since the snapshot was taken.
    async fn begin_mount(&self, image: &Image) -> Result<MountEntry<'_>> {
        let rel_path = image.rel_path.as_str();

        if !image.state().holds_mount() {
            if self.catalog.claim_mount(image.id).await? {
                return Ok(MountEntry::Claimed(self.lock.lock().await));
            }

            let current = self.lookup(rel_path).await?;
            if !current.state().holds_mount() {
                info!("Mount attempt already in progress for {}", rel_path);
                return Err(TackError::DuplicateMountInProgress { rel_path: rel_path.to_string() });
            }
        }

        let guard = self.lock.lock().await;
        // Re-check under the lock: an unmount may have released it meanwhile
        if let Some(count) = self.catalog.add_reference(image.id).await? {
            info!("{} is already mounted ({} consumers)", rel_path, count);
            return self.mount_info(image.id, rel_path).await.map(MountEntry::Shared);
        }
        if !self.catalog.claim_mount(image.id).await? {
            return Err(TackError::DuplicateMountInProgress { rel_path: rel_path.to_string() });
        }
        Ok(MountEntry::Claimed(guard))
    }

    /// Run the collaborator, falling back to the alternate backend when no
    /// volume could be mounted. Must be called with the mount lock held.
    async fn attempt(&self, image: &Image, credentials: Option<&Credentials>) -> Result<MountOutcome> {
        let mut backend = MountBackend::Auto;

        loop {
            let request = MountRequest {
                paths: vec![image.full_path.clone()],
                mount_root: self.settings.mount_dir.clone(),
                backend,
                credentials: credentials.cloned(),
            };

            metrics::counter!("tack_mount_attempts_total", "backend" => backend.to_string())
                .increment(1);
            debug!("Attempting mount of {} with backend {}", image.rel_path, backend);

            let parsed = self.mounter.attempt_mount(&request).await?;
            let handle = MountHandle::from_attempt(&request, &parsed);

            if parsed.disks.len() != 1 {
                self.release_quietly(&handle).await;
                return Err(TackError::UnexpectedDiskCount {
                    rel_path: image.rel_path.clone(),
                    count: parsed.disks.len(),
                });
            }

            let analysis = flatten::analyze(&parsed.disks[0]);

            // A volume group clash is reported after persisting whatever mounted
            if analysis.duplicate_volume_group.is_some() || analysis.any_mounted() {
                return Ok(MountOutcome { parsed, handle, analysis });
            }

            self.release_quietly(&handle).await;

            match backend.fallback() {
                Some(next) => {
                    warn!(
                        "No mountable volumes in {} with backend {}; retrying with {}",
                        image.rel_path, backend, next
                    );
                    backend = next;
                }
                None if analysis.encrypted => {
                    let reason = match credentials {
                        Some(creds) if !creds.is_empty() => "Incorrect decryption key provided.",
                        _ => "Try mounting with a decryption key.",
                    };
                    return Err(TackError::EncryptedImage {
                        rel_path: image.rel_path.clone(),
                        reason: reason.to_string(),
                    });
                }
                None => {
                    return Err(TackError::NoMountableVolumes { rel_path: image.rel_path.clone() })
                }
            }
        }
    }

    async fn persist(&self, id: i64, outcome: &MountOutcome) -> Result<()> {
        let disk_mountpoint =
            outcome.parsed.disks[0].mountpoint.as_deref().filter(|m| !m.is_empty());
        let status = if disk_mountpoint.is_some() {
            MountStatus::Mounted
        } else {
            MountStatus::UnableToMount
        };

        let handle = outcome.handle.encode()?;
        self.catalog
            .record_mount(id, status, disk_mountpoint, &handle, &outcome.analysis.volumes)
            .await
    }

    /// Return a claimed image to ref_count 0 after a failed attempt.
    async fn abandon(&self, id: i64, cause: &TackError) {
        let status = match cause {
            TackError::NoMountableVolumes { .. }
            | TackError::EncryptedImage { .. }
            | TackError::UnexpectedDiskCount { .. } => MountStatus::UnableToMount,
            _ => MountStatus::Unmounted,
        };

        if let Err(e) = self.catalog.abandon_claim(id, status).await {
            error!("Failed to reset mount claim for image {}: {}", id, e);
        }
    }

    async fn release_quietly(&self, handle: &MountHandle) {
        if let Err(e) = self.mounter.release(handle, true).await {
            warn!("Failed to release partial mount: {}", e);
        }
    }

    // ========================
    // Unmount
    // ========================

    /// Drop a consumer, releasing the OS mount when it was the last one.
    ///
    /// Returns true if the image is now unmounted, false if other consumers
    /// still hold it. `force` releases regardless of the consumer count.
    #[instrument(skip(self))]
    pub async fn unmount(&self, rel_path: &str, force: bool) -> Result<bool> {
        let image = self.lookup(rel_path).await?;
        if image.state() == ImageState::MountInFlight {
            return Err(TackError::DuplicateMountInProgress { rel_path: rel_path.to_string() });
        }
        self.unmount_image(image.id, rel_path, force).await
    }

    async fn unmount_image(&self, id: i64, rel_path: &str, force: bool) -> Result<bool> {
        let _guard = self.lock.lock().await;

        let image = self
            .catalog
            .get_image_by_id(id)
            .await?
            .ok_or_else(|| TackError::NotInCatalog { rel_path: rel_path.to_string() })?;

        match image.state() {
            ImageState::Unmounted | ImageState::UnableToMount => {
                debug!("{} is not mounted", rel_path);
                return Ok(true);
            }
            ImageState::MountInFlight => {
                return Err(TackError::DuplicateMountInProgress { rel_path: rel_path.to_string() });
            }
            ImageState::Mounted | ImageState::PartiallyMounted | ImageState::ManualMount => {}
        }

        if image.ref_count > 1 && !force {
            if let Some(count) = self.catalog.drop_reference(id).await? {
                info!("{} still has {} consumers; leaving it mounted", rel_path, count);
                return Ok(false);
            }
        }

        if image.status == MountStatus::ManualMount {
            self.catalog.clear_mount(id, true).await?;
            info!("Cleared manual mount of {}", rel_path);
        } else {
            let handle = match image.handle() {
                Ok(handle) => handle,
                Err(e) if force => {
                    warn!("Discarding unreadable mount handle for {}: {}", rel_path, e);
                    None
                }
                Err(e) => {
                    return Err(TackError::UnmountFailed {
                        rel_path: rel_path.to_string(),
                        reason: e.to_string(),
                    })
                }
            };

            if let Some(handle) = handle {
                self.mounter.release(&handle, true).await.map_err(|e| TackError::UnmountFailed {
                    rel_path: rel_path.to_string(),
                    reason: e.to_string(),
                })?;
            }

            self.catalog.clear_mount(id, false).await?;
            info!("Unmounted {}", rel_path);
        }

        metrics::counter!("tack_unmounts_total").increment(1);
        Ok(true)
    }

    /// Unmount every image with consumers, continuing past failures.
    #[instrument(skip(self))]
    pub async fn unmount_all(&self, force: bool) -> Result<UnmountReport> {
        let mut report = UnmountReport::default();

        for image in self.catalog.list_mounted_images().await? {
            match self.unmount_image(image.id, &image.rel_path, force).await {
                Ok(true) => report.released.push(image.rel_path),
                Ok(false) => report.still_referenced.push(image.rel_path),
                Err(e) => {
                    error!("Failed to unmount {}: {}", image.rel_path, e);
                    report.failed.push((image.rel_path, e.to_string()));
                }
            }
        }

        info!(
            "Unmount all: {} released, {} still referenced, {} failed",
            report.released.len(),
            report.still_referenced.len(),
            report.failed.len()
        );
        Ok(report)
    }

    // ========================
    // Manual mounts
    // ========================

    /// Track a mountpoint established outside tack.
    ///
    /// Returns false if the mountpoint is not an existing directory or the
    /// image already has consumers. The collaborator is never invoked.
    #[instrument(skip(self))]
    pub async fn register_manual_mount(&self, rel_path: &str, mountpoint: &Path) -> Result<bool> {
        if mountpoint.as_os_str().is_empty() {
            warn!("Refusing empty mountpoint for {}", rel_path);
            return Ok(false);
        }

        let is_dir = tokio::fs::metadata(mountpoint).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            warn!("{} is not a directory", mountpoint.display());
            return Ok(false);
        }

        let mountpoint_str = mountpoint.to_str().ok_or_else(|| TackError::InvalidMountpoint {
            path: mountpoint.to_path_buf(),
            reason: "path is not valid UTF-8".to_string(),
        })?;

        let image = self.lookup(rel_path).await?;

        let _guard = self.lock.lock().await;
        let recorded = self.catalog.record_manual_mount(image.id, mountpoint_str).await?;
        if recorded {
            info!("Registered manual mount of {} at {}", rel_path, mountpoint_str);
        } else {
            warn!("{} already has consumers; not registering manual mount", rel_path);
        }
        Ok(recorded)
    }

    // ========================
    // Reads
    // ========================

    /// Current mount of an image, or None if it holds no mount.
    pub async fn get(&self, rel_path: &str) -> Result<Option<MountInfo>> {
        let image = self.lookup(rel_path).await?;
        if !image.state().holds_mount() {
            return Ok(None);
        }
        self.build_mount_info(image).await.map(Some)
    }

    /// Every image that currently holds a mount.
    pub async fn list_mounted(&self) -> Result<Vec<MountInfo>> {
        let mut mounted = Vec::new();
        for image in self.catalog.list_mounted_images().await? {
            if image.state().holds_mount() {
                mounted.push(self.build_mount_info(image).await?);
            }
        }
        Ok(mounted)
    }

    /// Catalog listing, with volume details for mounted images.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let mut summaries = Vec::new();

        for image in self.catalog.list_images().await? {
            let volumes = if image.state().holds_mount() {
                self.catalog
                    .list_volumes(image.id)
                    .await?
                    .into_iter()
                    .map(|v| VolumeSummary {
                        index: v.partition_index,
                        uid: VolumeSummary::uid_for(&image.rel_path, v.partition_index),
                        mountpoint: v.mountpoint,
                        status: v.status,
                    })
                    .collect()
            } else {
                Vec::new()
            };

            summaries.push(ImageSummary {
                id: image.id,
                rel_path: image.rel_path,
                full_path: image.full_path,
                filename: image.filename,
                status: image.status,
                mountpoint: image.mountpoint,
                ref_count: image.ref_count,
                volumes,
            });
        }

        Ok(summaries)
    }

    /// Helper tools the collaborator can use.
    pub async fn supported_tools(&self) -> Result<BTreeMap<String, bool>> {
        self.mounter.supported_tools().await
    }

    /// Reset in-flight sentinels left by a process that died mid-mount.
    #[instrument(skip(self))]
    pub async fn recover_interrupted_mounts(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let reset = self.catalog.reset_interrupted_mounts().await?;
        if reset > 0 {
            warn!("Reset {} interrupted mount attempts", reset);
        }
        Ok(reset as usize)
    }

    // ========================
    // Helpers
    // ========================

    async fn lookup(&self, rel_path: &str) -> Result<Image> {
        self.catalog
            .get_image(rel_path)
            .await?
            .ok_or_else(|| TackError::NotInCatalog { rel_path: rel_path.to_string() })
    }

    async fn mount_info(&self, id: i64, rel_path: &str) -> Result<MountInfo> {
        let image = self
            .catalog
            .get_image_by_id(id)
            .await?
            .ok_or_else(|| TackError::NotInCatalog { rel_path: rel_path.to_string() })?;
        self.build_mount_info(image).await
    }

    async fn build_mount_info(&self, image: Image) -> Result<MountInfo> {
        let volumes = self.catalog.list_volumes(image.id).await?;

        Ok(MountInfo {
            disk: DiskView {
                imagepath: image.full_path,
                mountpoint: image.mountpoint,
                volumes: volumes.iter().map(|v| v.to_view()).collect(),
            },
            ref_count: image.ref_count,
        })
    }
}

/// The image must be a regular file we can open for reading.
async fn check_readable(path: &Path) -> Result<()> {
    let not_readable = || TackError::NotReadable { path: path.to_path_buf() };

    let metadata = tokio::fs::metadata(path).await.map_err(|_| not_readable())?;
    if !metadata.is_file() {
        return Err(not_readable());
    }
    tokio::fs::File::open(path).await.map_err(|_| not_readable())?;
    Ok(())
}
