//! SQLite record store
//!
//! The persistence collaborator for the federation engine. Records are
//! opaque JSON documents keyed by (table, id); the engine owns their
//! structure, the store only reads and writes whole columns.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use crate::error::AppError;

/// Well-known logical table names.
pub mod tables {
    pub const ACTORS: &str = "actors";
    pub const COLLECTIONS: &str = "collections";
    pub const KEYS: &str = "keys";
    pub const POLICY: &str = "policy";
    pub const ACCEPTS: &str = "accepts";
    pub const OBJECTS: &str = "objects";
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS records (
    tbl TEXT NOT NULL,
    id TEXT NOT NULL,
    doc TEXT NOT NULL,
    PRIMARY KEY (tbl, id)
)";

/// Database connection pool wrapper.
///
/// All documents live in a single `records` table; logical tables are a
/// column. Column-level mutation re-reads the document inside a
/// transaction so two writers on the same record cannot lose updates.
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database (used by tests).
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        // A single connection keeps every query on the same memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert or replace a whole record.
    ///
    /// The record must be a JSON object carrying a string `id` field.
    pub async fn insert(&self, table: &str, record: &serde_json::Value) -> Result<(), AppError> {
        let id = record
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Record is missing an id".to_string()))?;

        let doc = serde_json::to_string(record)
            .map_err(|e| AppError::Validation(format!("Unserializable record: {}", e)))?;

        sqlx::query("INSERT OR REPLACE INTO records (tbl, id, doc) VALUES (?, ?, ?)")
            .bind(table)
            .bind(id)
            .bind(doc)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Fetch a whole record, if present.
    pub async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let row = sqlx::query("SELECT doc FROM records WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let doc: String = row.get("doc");
                let value = serde_json::from_str(&doc)
                    .map_err(|e| AppError::Validation(format!("Corrupt record {}: {}", id, e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fetch a single column of a record.
    ///
    /// A missing record or a missing column is `NotFound`.
    pub async fn get(
        &self,
        table: &str,
        id: &str,
        column: &str,
    ) -> Result<serde_json::Value, AppError> {
        let record = self
            .get_record(table, id)
            .await?
            .ok_or(AppError::NotFound)?;

        record.get(column).cloned().ok_or(AppError::NotFound)
    }

    /// Set a single column of a record, creating the record if absent.
    ///
    /// The document is re-read and rewritten inside one transaction so the
    /// write applies to the freshest copy, not a stale in-memory one.
    pub async fn set(
        &self,
        table: &str,
        id: &str,
        column: &str,
        value: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT doc FROM records WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let mut record = match row {
            Some(row) => {
                let doc: String = row.get("doc");
                serde_json::from_str(&doc)
                    .map_err(|e| AppError::Validation(format!("Corrupt record {}: {}", id, e)))?
            }
            None => serde_json::json!({ "id": id }),
        };

        let serde_json::Value::Object(ref mut map) = record else {
            return Err(AppError::Validation(format!(
                "Record {} is not an object",
                id
            )));
        };
        map.insert(column.to_string(), value);

        let doc = serde_json::to_string(&record)
            .map_err(|e| AppError::Validation(format!("Unserializable record: {}", e)))?;

        sqlx::query("INSERT OR REPLACE INTO records (tbl, id, doc) VALUES (?, ?, ?)")
            .bind(table)
            .bind(id)
            .bind(doc)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a record. Deleting a missing record is a no-op.
    pub async fn delete(&self, table: &str, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM records WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// List the ids of every record in a logical table.
    pub async fn list_ids(&self, table: &str) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query("SELECT id FROM records WHERE tbl = ? ORDER BY id")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = Store::connect_in_memory().await.expect("store");
        let record = serde_json::json!({
            "id": "https://local.example/users/alice",
            "username": "alice",
        });

        store.insert(tables::ACTORS, &record).await.expect("insert");

        let username = store
            .get(tables::ACTORS, "https://local.example/users/alice", "username")
            .await
            .expect("get");
        assert_eq!(username, serde_json::json!("alice"));
    }

    #[tokio::test]
    async fn get_missing_record_is_not_found() {
        let store = Store::connect_in_memory().await.expect("store");

        let result = store.get(tables::ACTORS, "nope", "username").await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn get_missing_column_is_not_found() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .insert(tables::ACTORS, &serde_json::json!({ "id": "a" }))
            .await
            .expect("insert");

        let result = store.get(tables::ACTORS, "a", "missing").await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn set_creates_record_and_updates_column() {
        let store = Store::connect_in_memory().await.expect("store");

        store
            .set(tables::COLLECTIONS, "c1", "totalItems", serde_json::json!(0))
            .await
            .expect("set");
        store
            .set(tables::COLLECTIONS, "c1", "totalItems", serde_json::json!(2))
            .await
            .expect("set again");

        let total = store
            .get(tables::COLLECTIONS, "c1", "totalItems")
            .await
            .expect("get");
        assert_eq!(total, serde_json::json!(2));
    }

    #[tokio::test]
    async fn insert_without_id_is_rejected() {
        let store = Store::connect_in_memory().await.expect("store");

        let result = store
            .insert(tables::ACTORS, &serde_json::json!({ "username": "alice" }))
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .insert(tables::ACTORS, &serde_json::json!({ "id": "a" }))
            .await
            .expect("insert");

        store.delete(tables::ACTORS, "a").await.expect("delete");
        store.delete(tables::ACTORS, "a").await.expect("redelete");

        assert!(store.get_record(tables::ACTORS, "a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn list_ids_returns_table_contents() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .insert(tables::ACCEPTS, &serde_json::json!({ "id": "b" }))
            .await
            .expect("insert");
        store
            .insert(tables::ACCEPTS, &serde_json::json!({ "id": "a" }))
            .await
            .expect("insert");

        let ids = store.list_ids(tables::ACCEPTS).await.expect("list");
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
