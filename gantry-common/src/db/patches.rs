//! Durable patch records
//!
//! One row per data patch that any host instance has started or finished.
//! The PRIMARY KEY on `version` is the only mutual-exclusion primitive:
//! whichever process inserts the pending row first owns that patch, and
//! every other process sees a unique-constraint violation and skips it.
//! No advisory locks, no lease tables.
//!
//! # Patch Guidelines
//!
//! 1. **Never renumber a shipped patch** - Records persist in every deployed
//!    database and are matched by version id
//! 2. **Always add new patches** - One new version per data change
//! 3. **Keep patch bodies idempotent where possible** - A crash between
//!    claim and completion leaves a pending row that is never retried

use crate::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Lifecycle state of a patch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    /// Claimed by some instance; the body may be running or may have crashed
    Pending,
    /// Body finished successfully
    Completed,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Pending => "pending",
            PatchStatus::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PatchStatus::Pending),
            "completed" => Ok(PatchStatus::Completed),
            other => Err(Error::Internal(format!("unknown patch status: {}", other))),
        }
    }
}

/// A row from the patch_records table
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub version: i64,
    pub name: String,
    pub status: PatchStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This process inserted the record and must run the patch body
    Won,
    /// Another process already holds the record; skip the patch
    Lost,
}

/// Create the patch_records table
pub(crate) async fn create_patch_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patch_records (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed')),
            started_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Highest version id with any record, pending or completed
///
/// Returns 0 when no patch has ever been recorded. Pending rows count:
/// a patch that was claimed and never finished is still consumed.
pub async fn max_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM patch_records")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Try to claim a patch by inserting its pending record
///
/// Exactly one process can win for a given version, even across separate
/// host processes sharing the database file.
pub async fn claim(pool: &SqlitePool, version: i64, name: &str) -> Result<Claim> {
    let started_at = Utc::now().to_rfc3339();

    match sqlx::query(
        "INSERT INTO patch_records (version, name, status, started_at) VALUES (?, ?, 'pending', ?)",
    )
    .bind(version)
    .bind(name)
    .bind(&started_at)
    .execute(pool)
    .await
    {
        Ok(_) => Ok(Claim::Won),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // Another instance beat us to it - that's fine
            Ok(Claim::Lost)
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark a claimed patch as completed
pub async fn complete(pool: &SqlitePool, version: i64) -> Result<()> {
    let completed_at = Utc::now().to_rfc3339();

    let result = sqlx::query(
        "UPDATE patch_records SET status = 'completed', completed_at = ? WHERE version = ?",
    )
    .bind(&completed_at)
    .bind(version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("patch record {}", version)));
    }

    Ok(())
}

/// Fetch a single patch record
pub async fn find(pool: &SqlitePool, version: i64) -> Result<Option<PatchRecord>> {
    let row = sqlx::query_as::<_, (i64, String, String, String, Option<String>)>(
        "SELECT version, name, status, started_at, completed_at FROM patch_records WHERE version = ?",
    )
    .bind(version)
    .fetch_optional(pool)
    .await?;

    row.map(record_from_row).transpose()
}

/// All patch records, ascending by version
pub async fn list(pool: &SqlitePool) -> Result<Vec<PatchRecord>> {
    let rows = sqlx::query_as::<_, (i64, String, String, String, Option<String>)>(
        "SELECT version, name, status, started_at, completed_at FROM patch_records ORDER BY version",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(record_from_row).collect()
}

fn record_from_row(row: (i64, String, String, String, Option<String>)) -> Result<PatchRecord> {
    let (version, name, status, started_at, completed_at) = row;
    Ok(PatchRecord {
        version,
        name,
        status: PatchStatus::parse(&status)?,
        started_at,
        completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::init::open_pool;

    async fn setup_test_db(dir: &tempfile::TempDir) -> SqlitePool {
        let config = DatabaseConfig {
            path: dir.path().join("patches.db"),
            max_connections: 5,
        };
        open_pool(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_max_version_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        assert_eq!(max_version(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        assert_eq!(claim(&pool, 1, "create_users").await.unwrap(), Claim::Won);

        let record = find(&pool, 1).await.unwrap().unwrap();
        assert_eq!(record.name, "create_users");
        assert_eq!(record.status, PatchStatus::Pending);
        assert!(record.completed_at.is_none());

        complete(&pool, 1).await.unwrap();

        let record = find(&pool, 1).await.unwrap().unwrap();
        assert_eq!(record.status, PatchStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_second_claim_loses() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        assert_eq!(claim(&pool, 3, "first").await.unwrap(), Claim::Won);
        assert_eq!(claim(&pool, 3, "second").await.unwrap(), Claim::Lost);

        // The losing claim must not overwrite the winner's record
        let record = find(&pool, 3).await.unwrap().unwrap();
        assert_eq!(record.name, "first");
    }

    #[tokio::test]
    async fn test_pending_counts_toward_max_version() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        claim(&pool, 1, "one").await.unwrap();
        complete(&pool, 1).await.unwrap();
        claim(&pool, 2, "two").await.unwrap();
        // version 2 left pending on purpose

        assert_eq!(max_version(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_complete_without_claim_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        let result = complete(&pool, 9).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_claim_race_across_pools() {
        // Two pools on the same file stand in for two host processes
        let dir = tempfile::tempdir().unwrap();
        let pool_a = setup_test_db(&dir).await;
        let pool_b = setup_test_db(&dir).await;

        let a = tokio::spawn({
            let pool = pool_a.clone();
            async move { claim(&pool, 7, "racer").await.unwrap() }
        });
        let b = tokio::spawn({
            let pool = pool_b.clone();
            async move { claim(&pool, 7, "racer").await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let wins = [a, b].iter().filter(|c| **c == Claim::Won).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        claim(&pool, 2, "two").await.unwrap();
        claim(&pool, 1, "one").await.unwrap();
        claim(&pool, 3, "three").await.unwrap();

        let records = list(&pool).await.unwrap();
        let versions: Vec<i64> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}
