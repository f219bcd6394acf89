//! Integration tests for database initialization
//!
//! Exercises pool creation, the base schema, and cross-pool visibility of
//! patch records through a shared database file.

use gantry_common::config::DatabaseConfig;
use gantry_common::db::{self, open_pool, Collection, PatchStatus};
use serde_json::json;

fn config_in(dir: &tempfile::TempDir, file: &str) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join(file),
        max_connections: 5,
    }
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, "fresh.db");
    assert!(!config.path.exists());

    let pool = open_pool(&config).await.unwrap();

    assert!(config.path.exists(), "Database file was not created");

    // Base schema is in place
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='patch_records')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(table_exists, "patch_records table was not created");

    pool.close().await;
}

#[tokio::test]
async fn test_wal_mode_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(&config_in(&dir, "wal.db")).await.unwrap();

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    pool.close().await;
}

#[tokio::test]
async fn test_two_pools_share_one_file() {
    // Stand-in for two host processes opening the same database
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, "shared.db");

    let pool_a = open_pool(&config).await.unwrap();
    let pool_b = open_pool(&config).await.unwrap();

    assert_eq!(db::claim(&pool_a, 1, "seed").await.unwrap(), db::Claim::Won);
    db::complete(&pool_a, 1).await.unwrap();

    // The second pool sees the first pool's record
    let record = db::find(&pool_b, 1).await.unwrap().unwrap();
    assert_eq!(record.status, PatchStatus::Completed);
    assert_eq!(db::max_version(&pool_b).await.unwrap(), 1);

    pool_a.close().await;
    pool_b.close().await;
}

#[tokio::test]
async fn test_documents_visible_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, "docs.db");

    let pool_a = open_pool(&config).await.unwrap();
    let pool_b = open_pool(&config).await.unwrap();

    let writers = Collection::open(&pool_a, "notes").await.unwrap();
    let readers = Collection::open(&pool_b, "notes").await.unwrap();

    let doc = writers.create(json!({"text": "hello"})).await.unwrap();
    let found = readers.find_by_id(doc.id()).await.unwrap().unwrap();
    assert_eq!(found.body()["text"], "hello");

    pool_a.close().await;
    pool_b.close().await;
}
