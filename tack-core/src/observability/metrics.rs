//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Mount lifecycle metrics
    describe_counter!(
        "tack_mount_attempts_total",
        "Total number of collaborator mount attempts (by backend)"
    );
    describe_counter!("tack_mount_failures_total", "Total number of failed mounts (by reason)");
    describe_counter!("tack_mounts_total", "Total number of images mounted by the collaborator");
    describe_counter!("tack_unmounts_total", "Total number of images fully unmounted");
    describe_histogram!(
        "tack_mount_duration_seconds",
        "Time taken by a successful mount request, including fast-path references"
    );

    // Catalog metrics
    describe_gauge!("tack_images_catalogued", "Current number of catalogued disk images");
    describe_histogram!("tack_reconcile_duration_seconds", "Directory reconciliation pass duration");
    describe_counter!("tack_db_errors_total", "Total catalog statement failures (by operation)");
}
