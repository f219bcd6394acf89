//! Database initialization
//!
//! Opens (creating on first run) the SQLite database backing a hosted
//! application and prepares the tables the host itself needs. Application
//! document tables are created lazily by [`crate::db::docstore`].

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

/// Open the host database and create base tables if needed
pub async fn open_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let newly_created = !config.path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // mode=rwc creates the database file on first run
    let db_url = format!("sqlite://{}?mode=rwc", config.path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", config.path.display());
    } else {
        info!("Opened existing database: {}", config.path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers with one writer. Patch claiming
    // depends on a second host process being able to use the same file.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    // Wait out short lock contention instead of failing immediately
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Idempotent, safe when another process got here first
    crate::db::patches::create_patch_records_table(&pool).await?;

    Ok(pool)
}
