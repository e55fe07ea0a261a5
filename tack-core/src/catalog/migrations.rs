//! Database migrations.

use crate::error::{Result, TackError};
use crate::types::MountStatus;
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create schema_version table if not exists
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    // Get current schema version
    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    let mut tx =
        pool.begin().await.map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    // Fixed status codes, used as a foreign-key target and never mutated
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mount_status_codes (
            id INTEGER PRIMARY KEY,
            status TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    for status in MountStatus::ALL {
        sqlx::query("INSERT OR IGNORE INTO mount_status_codes (id, status) VALUES (?, ?)")
            .bind(status.code())
            .bind(status.label())
            .execute(&mut *tx)
            .await
            .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;
    }

    // Disk images table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS disk_images (
            id INTEGER PRIMARY KEY,
            mount_status_id INTEGER NOT NULL REFERENCES mount_status_codes(id),
            full_path TEXT NOT NULL UNIQUE,
            rel_path TEXT NOT NULL,
            filename TEXT NOT NULL,
            mountpoint TEXT,
            ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
            mount_handle BLOB
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_disk_images_rel_path ON disk_images(rel_path)")
        .execute(&mut *tx)
        .await
        .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    // Volumes table (nested volumes flattened in)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS volumes (
            id INTEGER PRIMARY KEY,
            disk_id INTEGER NOT NULL REFERENCES disk_images(id) ON DELETE CASCADE,
            mount_status_id INTEGER NOT NULL REFERENCES mount_status_codes(id),
            partition_index INTEGER NOT NULL,
            mountpoint TEXT,
            size_bytes INTEGER,
            offset_bytes INTEGER,
            fstype TEXT,
            fsdescription TEXT,
            label TEXT,
            UNIQUE(disk_id, partition_index)
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
        .execute(&mut *tx)
        .await
        .map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    tx.commit().await.map_err(|e| TackError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to version 1 complete");
    Ok(())
}
