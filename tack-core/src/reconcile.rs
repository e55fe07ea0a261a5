//! Directory reconciliation.
//!
//! Syncs the catalog with the watched directory in a single pass: one walk
//! collects every file that passes the ignore-filter, then one set difference
//! against the catalog inserts new images and removes vanished ones.
//!
//! The reconciler never takes the mount lock. It only deletes rows with
//! `ref_count = 0`, so an image that disappears while mounted stays catalogued
//! until it is unmounted.

use crate::catalog::Catalog;
use crate::error::{Result, TackError};
use crate::filter::IgnoreFilter;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// A file found during the walk that belongs in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscoveredImage {
    full_path: PathBuf,
    rel_path: String,
    filename: String,
}

/// Result of walking the watched tree.
#[derive(Debug, Default)]
struct WalkOutcome {
    images: Vec<DiscoveredImage>,
    /// Entries that could not be read; deletions are skipped when non-zero
    errors: usize,
}

/// Report of reconciliation actions taken.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Images newly inserted into the catalog
    pub added: usize,
    /// Images removed because their file is gone (or now ignored)
    pub removed: usize,
    /// Vanished images kept because they are still referenced
    pub retained: usize,
    /// Walk entries that could not be read
    pub walk_errors: usize,
    /// Catalog inserts or removals that failed; the pass continues past them
    pub failed: usize,
    /// Catalogued images after the pass
    pub total: usize,
}

/// Syncs the catalog against the watched directory.
#[derive(Clone)]
pub struct DirectoryReconciler {
    catalog: Catalog,
    image_dir: PathBuf,
    skip_subdirectories: HashSet<String>,
    filter: IgnoreFilter,
}

impl DirectoryReconciler {
    pub fn new(
        catalog: Catalog,
        image_dir: impl Into<PathBuf>,
        skip_subdirectories: impl IntoIterator<Item = String>,
        filter: IgnoreFilter,
    ) -> Self {
        Self {
            catalog,
            image_dir: image_dir.into(),
            skip_subdirectories: skip_subdirectories.into_iter().collect(),
            filter,
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Run one reconciliation pass.
    #[instrument(skip(self), fields(image_dir = %self.image_dir.display()))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let started = Instant::now();

        // Refuse to diff against an unreadable root: it would look like every
        // image vanished.
        tokio::fs::read_dir(&self.image_dir)
            .await
            .map_err(|e| TackError::IoError { path: self.image_dir.clone(), source: e })?;

        let root = self.image_dir.clone();
        let skip = self.skip_subdirectories.clone();
        let filter = self.filter.clone();
        let walk = tokio::task::spawn_blocking(move || walk_images(&root, &skip, &filter))
            .await
            .map_err(TackError::internal)?;

        let mut report = ReconcileReport { walk_errors: walk.errors, ..Default::default() };

        let catalogued: HashMap<PathBuf, (i64, u32)> = self
            .catalog
            .list_catalogued_paths()
            .await?
            .into_iter()
            .map(|(id, path, ref_count)| (path, (id, ref_count)))
            .collect();

        let on_disk: HashSet<&Path> = walk.images.iter().map(|i| i.full_path.as_path()).collect();

        for image in &walk.images {
            if catalogued.contains_key(&image.full_path) {
                continue;
            }
            match self
                .catalog
                .insert_image_if_absent(&image.full_path, &image.rel_path, &image.filename)
                .await
            {
                Ok(true) => report.added += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to catalogue {}: {}", image.rel_path, e);
                    report.failed += 1;
                }
            }
        }

        if walk.errors > 0 {
            warn!(
                "Skipping catalog removals: {} entries under {} could not be read",
                walk.errors,
                self.image_dir.display()
            );
        } else {
            for (path, (id, ref_count)) in &catalogued {
                if on_disk.contains(path.as_path()) {
                    continue;
                }
                match self.catalog.delete_unreferenced_image(*id).await {
                    Ok(true) => {
                        debug!("Removed disk image from catalog: {}", path.display());
                        report.removed += 1;
                    }
                    Ok(false) if *ref_count > 0 => {
                        warn!(
                            "{} vanished from disk but has {} outstanding references; keeping it",
                            path.display(),
                            ref_count
                        );
                        report.retained += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to remove {} from catalog: {}", path.display(), e);
                        report.failed += 1;
                    }
                }
            }
        }

        let total = self.catalog.count_images().await?;
        report.total = total.max(0) as usize;

        metrics::gauge!("tack_images_catalogued").set(total as f64);
        metrics::histogram!("tack_reconcile_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if report.added > 0 || report.removed > 0 || report.failed > 0 {
            info!(
                "Reconciliation complete: {} added, {} removed, {} retained, {} failed, {} total",
                report.added, report.removed, report.retained, report.failed, report.total
            );
        } else {
            debug!("Reconciliation complete: no changes ({} images)", report.total);
        }

        Ok(report)
    }
}

/// Walk `root`, pruning skipped subdirectories, and collect catalogue-worthy files.
fn walk_images(root: &Path, skip: &HashSet<String>, filter: &IgnoreFilter) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        !(entry.depth() > 0
            && entry.file_type().is_dir()
            && skip.contains(entry.file_name().to_string_lossy().as_ref()))
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read directory entry: {}", e);
                outcome.errors += 1;
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().to_string();
        if filename.starts_with('.') {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        if filter.should_ignore(&full_path) || !full_path.is_file() {
            continue;
        }

        let Ok(rel_path) = full_path.strip_prefix(root) else {
            continue;
        };
        let rel_path = rel_path.to_string_lossy().to_string();

        outcome.images.push(DiscoveredImage { full_path, rel_path, filename });
    }

    outcome
}
