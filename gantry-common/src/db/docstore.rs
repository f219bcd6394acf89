//! Generic JSON document collections
//!
//! The persistence surface handed to hosted applications: named collections
//! of schemaless JSON documents. Each collection is backed by a lazily
//! created `doc_{name}` table; bodies are stored as serialized JSON text.

use crate::{Error, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// Handle on a named document collection
///
/// Cheap to clone; clones share the underlying pool.
#[derive(Debug, Clone)]
pub struct Collection {
    pool: SqlitePool,
    name: String,
    table: String,
}

impl Collection {
    /// Open a collection, creating its backing table on first use
    ///
    /// Collection names are restricted to `[a-z0-9_]+` because they are
    /// interpolated into table names.
    pub async fn open(pool: &SqlitePool, name: &str) -> Result<Collection> {
        if !is_valid_name(name) {
            return Err(Error::InvalidInput(format!(
                "invalid collection name {:?} (allowed: [a-z0-9_]+)",
                name
            )));
        }

        let table = format!("doc_{}", name);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            table
        ))
        .execute(pool)
        .await?;

        debug!("Opened collection '{}'", name);
        Ok(Collection {
            pool: pool.clone(),
            name: name.to_string(),
            table,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a new document
    ///
    /// The id comes from a string `_id` field in the body when present,
    /// otherwise a fresh UUID is assigned. Inserting a duplicate `_id`
    /// surfaces the database error to the caller.
    pub async fn create(&self, body: Value) -> Result<Document> {
        let id = match body.get("_id").and_then(Value::as_str) {
            Some(explicit) => explicit.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let now = Utc::now().to_rfc3339();

        sqlx::query(&format!(
            "INSERT INTO {} (id, body, created_at, updated_at) VALUES (?, ?, ?, ?)",
            self.table
        ))
        .bind(&id)
        .bind(body.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(Document {
            collection: self.clone(),
            id,
            body,
        })
    }

    /// Fetch a document by id
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        let raw: Option<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {} WHERE id = ?", self.table))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            Some(raw) => {
                let body: Value = serde_json::from_str(&raw).map_err(|e| {
                    Error::Internal(format!("corrupt document {}/{}: {}", self.name, id, e))
                })?;
                Ok(Some(Document {
                    collection: self.clone(),
                    id: id.to_string(),
                    body,
                }))
            }
            None => Ok(None),
        }
    }

    /// Number of documents in the collection
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// A document read from (or inserted into) a collection
#[derive(Debug, Clone)]
pub struct Document {
    collection: Collection,
    id: String,
    body: Value,
}

impl Document {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Replace the stored body
    pub async fn update(&mut self, body: Value) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET body = ?, updated_at = ? WHERE id = ?",
            self.collection.table
        ))
        .bind(body.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&self.id)
        .execute(&self.collection.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "document {}/{}",
                self.collection.name, self.id
            )));
        }

        self.body = body;
        Ok(())
    }

    /// Remove the document from its collection
    pub async fn delete(self) -> Result<()> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ?",
            self.collection.table
        ))
        .bind(&self.id)
        .execute(&self.collection.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "document {}/{}",
                self.collection.name, self.id
            )));
        }

        Ok(())
    }

    /// Re-read the body from the store, discarding local changes
    pub async fn reload(&mut self) -> Result<()> {
        match self.collection.find_by_id(&self.id).await? {
            Some(fresh) => {
                self.body = fresh.body;
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "document {}/{}",
                self.collection.name, self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::init::open_pool;
    use serde_json::json;

    async fn setup_test_db(dir: &tempfile::TempDir) -> SqlitePool {
        let config = DatabaseConfig {
            path: dir.path().join("docs.db"),
            max_connections: 5,
        };
        open_pool(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let tasks = Collection::open(&pool, "tasks").await.unwrap();

        let doc = tasks
            .create(json!({"title": "write docs", "done": false}))
            .await
            .unwrap();
        assert!(!doc.id().is_empty());

        let found = tasks.find_by_id(doc.id()).await.unwrap().unwrap();
        assert_eq!(found.body()["title"], "write docs");
        assert_eq!(found.body()["done"], false);
    }

    #[tokio::test]
    async fn test_explicit_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let markers = Collection::open(&pool, "markers").await.unwrap();

        let doc = markers
            .create(json!({"_id": "startup", "ready": true}))
            .await
            .unwrap();
        assert_eq!(doc.id(), "startup");

        let found = markers.find_by_id("startup").await.unwrap().unwrap();
        assert_eq!(found.body()["ready"], true);

        // Same explicit id again is a database error, not a silent overwrite
        let dup = markers.create(json!({"_id": "startup"})).await;
        assert!(matches!(dup, Err(Error::Database(_))));
    }

    #[tokio::test]
    async fn test_update_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let tasks = Collection::open(&pool, "tasks").await.unwrap();

        let mut doc = tasks.create(json!({"done": false})).await.unwrap();
        doc.update(json!({"done": true})).await.unwrap();
        assert_eq!(doc.body()["done"], true);

        let mut other = tasks.find_by_id(doc.id()).await.unwrap().unwrap();
        assert_eq!(other.body()["done"], true);

        doc.update(json!({"done": false})).await.unwrap();
        other.reload().await.unwrap();
        assert_eq!(other.body()["done"], false);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let tasks = Collection::open(&pool, "tasks").await.unwrap();

        let doc = tasks.create(json!({"x": 1})).await.unwrap();
        let id = doc.id().to_string();

        doc.delete().await.unwrap();
        assert!(tasks.find_by_id(&id).await.unwrap().is_none());
        assert_eq!(tasks.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_after_delete_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let tasks = Collection::open(&pool, "tasks").await.unwrap();

        let mut doc = tasks.create(json!({"x": 1})).await.unwrap();
        let copy = tasks.find_by_id(doc.id()).await.unwrap().unwrap();
        copy.delete().await.unwrap();

        let result = doc.update(json!({"x": 2})).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let tasks = Collection::open(&pool, "tasks").await.unwrap();

        assert!(tasks.find_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_collection_names() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;

        for bad in ["", "Tasks", "a-b", "users; DROP TABLE x", "emoji🎉"] {
            let result = Collection::open(&pool, bad).await;
            assert!(
                matches!(result, Err(Error::InvalidInput(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(&dir).await;
        let a = Collection::open(&pool, "alpha").await.unwrap();
        let b = Collection::open(&pool, "beta").await.unwrap();

        a.create(json!({"from": "a"})).await.unwrap();
        assert_eq!(a.count().await.unwrap(), 1);
        assert_eq!(b.count().await.unwrap(), 0);
    }
}
