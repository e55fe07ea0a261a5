//! Image catalog with SQLite persistence.
//!
//! The Catalog is the single source of truth for:
//! - Disk images discovered under the watched directory
//! - Their mount status, mountpoint, ref-count and mount handle
//! - Per-volume mount status (nested volumes flattened in)
//!
//! Every method runs one statement, or one short transaction when several
//! rows must change together. Nothing here holds a transaction open across a
//! call into the mounting collaborator.

use crate::error::{Result, TackError};
use crate::types::{Image, MountStatus, VolumeRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, instrument};

pub mod migrations;


/// Map a sqlx error to a catalog error, counting it per operation.
fn db_error(operation: &'static str, e: sqlx::Error) -> TackError {
    metrics::counter!("tack_db_errors_total", "operation" => operation).increment(1);
    TackError::DatabaseError(e.to_string())
}

/// Catalog store for persistent image and volume state.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Create a catalog backed by a private in-memory database (for tests).
    ///
    /// Uses a single connection that never expires, since every SQLite
    /// in-memory connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| TackError::DatabaseError(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| TackError::DatabaseError(e.to_string()))?;

        let catalog = Self { pool };
        catalog.run_migrations().await?;
        Ok(catalog)
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open (or create) the catalog database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing catalog at {:?}", db_path);

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| TackError::InvalidConfig {
                reason: format!("Failed to create directory {}: {}", parent.display(), e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| TackError::DatabaseError(e.to_string()))?;

        let catalog = Self { pool };
        catalog.run_migrations().await?;

        info!("Catalog initialized successfully");
        Ok(catalog)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Read the fixed status-code table as `(id, label)` pairs.
    pub async fn mount_status_codes(&self) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query("SELECT id, status FROM mount_status_codes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("mount_status_codes", e))?;

        Ok(rows.into_iter().map(|row| (row.get("id"), row.get("status"))).collect())
    }

    // ========================
    // Image Operations
    // ========================

    /// Insert an image unless its absolute path is already catalogued.
    ///
    /// Returns true if a row was inserted.
    #[instrument(skip(self), fields(path = %full_path.display()))]
    pub async fn insert_image_if_absent(
        &self,
        full_path: &Path,
        rel_path: &str,
        filename: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO disk_images (full_path, rel_path, filename, mount_status_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(full_path) DO NOTHING
            "#,
        )
        .bind(full_path.to_string_lossy().as_ref())
        .bind(rel_path)
        .bind(filename)
        .bind(MountStatus::Unmounted.code())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert_image", e))?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!("Inserted disk image into catalog: {}", rel_path);
        }
        Ok(inserted)
    }

    /// Get an image by its path relative to the watched root.
    #[instrument(skip(self))]
    pub async fn get_image(&self, rel_path: &str) -> Result<Option<Image>> {
        sqlx::query("SELECT * FROM disk_images WHERE rel_path = ? ORDER BY id LIMIT 1")
            .bind(rel_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get_image", e))?
            .map(|row| self.row_to_image(row))
            .transpose()
    }

    /// Get an image by catalog id.
    #[instrument(skip(self))]
    pub async fn get_image_by_id(&self, id: i64) -> Result<Option<Image>> {
        sqlx::query("SELECT * FROM disk_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get_image", e))?
            .map(|row| self.row_to_image(row))
            .transpose()
    }

    /// List all images.
    #[instrument(skip(self))]
    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query("SELECT * FROM disk_images ORDER BY rel_path")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list_images", e))?;

        rows.into_iter().map(|row| self.row_to_image(row)).collect()
    }

    /// List images with at least one consumer (mounted or mount in flight).
    #[instrument(skip(self))]
    pub async fn list_mounted_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query("SELECT * FROM disk_images WHERE ref_count > 0 ORDER BY rel_path")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list_mounted_images", e))?;

        rows.into_iter().map(|row| self.row_to_image(row)).collect()
    }

    /// Number of catalogued images.
    pub async fn count_images(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM disk_images")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("count_images", e))
    }

    /// `(id, full_path, ref_count)` of every catalogued image.
    #[instrument(skip(self))]
    pub async fn list_catalogued_paths(&self) -> Result<Vec<(i64, PathBuf, u32)>> {
        let rows = sqlx::query("SELECT id, full_path, ref_count FROM disk_images")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list_catalogued_paths", e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let full_path: String = row.get("full_path");
                let ref_count: i64 = row.get("ref_count");
                (id, PathBuf::from(full_path), ref_count.max(0) as u32)
            })
            .collect())
    }

    /// Delete an image (and its volumes) unless something still references it.
    ///
    /// Returns false if the image is gone already or has ref_count > 0.
    #[instrument(skip(self))]
    pub async fn delete_unreferenced_image(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM disk_images WHERE id = ? AND ref_count = 0")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_image", e))?;

        Ok(result.rows_affected() > 0)
    }

    fn row_to_image(&self, row: sqlx::sqlite::SqliteRow) -> Result<Image> {
        let status_id: i64 = row.get("mount_status_id");
        let status = MountStatus::from_code(status_id).ok_or_else(|| {
            TackError::DatabaseError(format!("Unknown mount status id {}", status_id))
        })?;

        let ref_count: i64 = row.get("ref_count");

        Ok(Image {
            id: row.get("id"),
            full_path: row.get::<String, _>("full_path").into(),
            rel_path: row.get("rel_path"),
            filename: row.get("filename"),
            status,
            mountpoint: row.get("mountpoint"),
            ref_count: ref_count.max(0) as u32,
            mount_handle: row.get("mount_handle"),
        })
    }

    // ========================
    // Ref-count transitions
    // ========================

    /// Place the in-flight sentinel (`ref_count = 1`, status Unmounted).
    ///
    /// Compare-and-set: only succeeds on a row with `ref_count = 0`, so at
    /// most one caller can claim a mount attempt for an image.
    #[instrument(skip(self))]
    pub async fn claim_mount(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 1, mount_status_id = ?, mountpoint = NULL, mount_handle = NULL
            WHERE id = ? AND ref_count = 0
            "#,
        )
        .bind(MountStatus::Unmounted.code())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("claim_mount", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Roll back an in-flight sentinel after a failed attempt.
    #[instrument(skip(self))]
    pub async fn abandon_claim(&self, id: i64, status: MountStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 0, mount_status_id = ?, mountpoint = NULL, mount_handle = NULL
            WHERE id = ? AND ref_count = 1 AND mount_status_id = ?
            "#,
        )
        .bind(status.code())
        .bind(id)
        .bind(MountStatus::Unmounted.code())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("abandon_claim", e))?;

        Ok(())
    }

    /// Add a consumer to an image that holds a mount.
    ///
    /// Returns the new ref_count, or None if the image holds no mount.
    #[instrument(skip(self))]
    pub async fn add_reference(&self, id: i64) -> Result<Option<u32>> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE disk_images
            SET ref_count = ref_count + 1
            WHERE id = ? AND ref_count > 0 AND mount_status_id != ?
            RETURNING ref_count
            "#,
        )
        .bind(id)
        .bind(MountStatus::Unmounted.code())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("add_reference", e))?;

        Ok(count.map(|c| c.max(0) as u32))
    }

    /// Drop one consumer while others remain.
    ///
    /// Returns the new ref_count, or None if fewer than two consumers exist.
    #[instrument(skip(self))]
    pub async fn drop_reference(&self, id: i64) -> Result<Option<u32>> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE disk_images
            SET ref_count = ref_count - 1
            WHERE id = ? AND ref_count > 1
            RETURNING ref_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("drop_reference", e))?;

        Ok(count.map(|c| c.max(0) as u32))
    }

    /// Persist the outcome of a completed mount attempt.
    ///
    /// Updates the image row and replaces its volume rows in one
    /// transaction: rows are upserted by partition index, and indices that
    /// the new attempt did not produce are removed.
    #[instrument(skip(self, handle, volumes), fields(volumes = volumes.len()))]
    pub async fn record_mount(
        &self,
        id: i64,
        status: MountStatus,
        mountpoint: Option<&str>,
        handle: &[u8],
        volumes: &[VolumeRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("record_mount", e))?;

        sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 1, mountpoint = ?, mount_status_id = ?, mount_handle = ?
            WHERE id = ?
            "#,
        )
        .bind(mountpoint)
        .bind(status.code())
        .bind(handle)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record_mount", e))?;

        for volume in volumes {
            sqlx::query(
                r#"
                INSERT INTO volumes (disk_id, mount_status_id, partition_index, mountpoint,
                                     size_bytes, offset_bytes, fstype, fsdescription, label)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(disk_id, partition_index) DO UPDATE SET
                    mount_status_id = excluded.mount_status_id,
                    mountpoint = excluded.mountpoint,
                    size_bytes = excluded.size_bytes,
                    offset_bytes = excluded.offset_bytes,
                    fstype = excluded.fstype,
                    fsdescription = excluded.fsdescription,
                    label = excluded.label
                "#,
            )
            .bind(id)
            .bind(volume.status.code())
            .bind(i64::from(volume.partition_index))
            .bind(volume.mountpoint.as_deref())
            .bind(volume.size_bytes.map(|s| s as i64))
            .bind(volume.offset_bytes.map(|o| o as i64))
            .bind(volume.fstype.as_deref())
            .bind(volume.fsdescription.as_deref())
            .bind(volume.label.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("record_mount", e))?;
        }

        let current: HashSet<u32> = volumes.iter().map(|v| v.partition_index).collect();
        let existing: Vec<i64> =
            sqlx::query_scalar("SELECT partition_index FROM volumes WHERE disk_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| db_error("record_mount", e))?;

        for stale in existing.into_iter().filter(|i| !current.contains(&(*i as u32))) {
            sqlx::query("DELETE FROM volumes WHERE disk_id = ? AND partition_index = ?")
                .bind(id)
                .bind(stale)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("record_mount", e))?;
        }

        tx.commit().await.map_err(|e| db_error("record_mount", e))?;
        Ok(())
    }

    /// Record an out-of-band mountpoint for an unmounted image.
    ///
    /// Returns false (and changes nothing) if the image has consumers.
    #[instrument(skip(self))]
    pub async fn record_manual_mount(&self, id: i64, mountpoint: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("record_manual_mount", e))?;

        let result = sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 1, mountpoint = ?, mount_status_id = ?, mount_handle = NULL
            WHERE id = ? AND ref_count = 0
            "#,
        )
        .bind(mountpoint)
        .bind(MountStatus::ManualMount.code())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record_manual_mount", e))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| db_error("record_manual_mount", e))?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM volumes WHERE disk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("record_manual_mount", e))?;

        let volume = VolumeRecord::manual(mountpoint);
        sqlx::query(
            "INSERT INTO volumes (disk_id, mount_status_id, partition_index, mountpoint) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(volume.status.code())
        .bind(i64::from(volume.partition_index))
        .bind(volume.mountpoint.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record_manual_mount", e))?;

        tx.commit().await.map_err(|e| db_error("record_manual_mount", e))?;
        Ok(true)
    }

    /// Reset an image to unmounted and clear or delete its volume rows.
    ///
    /// `delete_volumes` is used for manual mounts, whose volume rows are
    /// placeholders; otherwise rows are kept with their mountpoints cleared.
    #[instrument(skip(self))]
    pub async fn clear_mount(&self, id: i64, delete_volumes: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("clear_mount", e))?;

        sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 0, mountpoint = NULL, mount_status_id = ?, mount_handle = NULL
            WHERE id = ?
            "#,
        )
        .bind(MountStatus::Unmounted.code())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("clear_mount", e))?;

        if delete_volumes {
            sqlx::query("DELETE FROM volumes WHERE disk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clear_mount", e))?;
        } else {
            sqlx::query("UPDATE volumes SET mountpoint = NULL, mount_status_id = ? WHERE disk_id = ?")
                .bind(MountStatus::Unmounted.code())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clear_mount", e))?;
        }

        tx.commit().await.map_err(|e| db_error("clear_mount", e))?;
        Ok(())
    }

    /// Reset in-flight sentinels left behind by an interrupted process.
    ///
    /// Returns the number of images reset.
    #[instrument(skip(self))]
    pub async fn reset_interrupted_mounts(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE disk_images
            SET ref_count = 0, mountpoint = NULL, mount_handle = NULL
            WHERE ref_count > 0 AND mount_status_id = ?
            "#,
        )
        .bind(MountStatus::Unmounted.code())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("reset_interrupted_mounts", e))?;

        Ok(result.rows_affected())
    }

    // ========================
    // Volume Operations
    // ========================

    /// List the volume rows of an image, ordered by partition index.
    #[instrument(skip(self))]
    pub async fn list_volumes(&self, disk_id: i64) -> Result<Vec<VolumeRecord>> {
        let rows =
            sqlx::query("SELECT * FROM volumes WHERE disk_id = ? ORDER BY partition_index")
                .bind(disk_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("list_volumes", e))?;

        rows.into_iter().map(|row| self.row_to_volume(row)).collect()
    }

    fn row_to_volume(&self, row: sqlx::sqlite::SqliteRow) -> Result<VolumeRecord> {
        let status_id: i64 = row.get("mount_status_id");
        let status = MountStatus::from_code(status_id).ok_or_else(|| {
            TackError::DatabaseError(format!("Unknown mount status id {}", status_id))
        })?;

        let partition_index: i64 = row.get("partition_index");

        Ok(VolumeRecord {
            partition_index: partition_index.max(0) as u32,
            status,
            mountpoint: row.get("mountpoint"),
            size_bytes: row.get::<Option<i64>, _>("size_bytes").map(|s| s as u64),
            offset_bytes: row.get::<Option<i64>, _>("offset_bytes").map(|o| o as u64),
            fstype: row.get("fstype"),
            fsdescription: row.get("fsdescription"),
            label: row.get("label"),
        })
    }
}
