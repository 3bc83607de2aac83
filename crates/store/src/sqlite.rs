//! SQLite vector store.
//!
//! One database file with two tables:
//! - `collections`: the fixed embedding dimension of each collection
//! - `vectors`: documents with their metadata (JSON) and embedding (f32 LE blob)
//!
//! Ranking happens in Rust over the rows of the queried collection.

use std::str::FromStr;

use async_trait::async_trait;
use rondo_core::error::StoreError;
use rondo_core::rag::{MetadataFilter, ScoredDocument, VectorRecord, VectorStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::in_memory::check_dimension;
use crate::vector;

/// Open a pool on a SQLite path (`":memory:"` for an ephemeral database).
pub(crate) async fn open_pool(path: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .pragma("foreign_keys", "ON");

    // An in-memory database exists per connection, so keep exactly one.
    let max_connections = if path.contains(":memory:") { 1 } else { 4 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))
}

async fn fix_dimension(conn: &mut SqliteConnection, collection: &str, dimension: usize) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO collections (name, dimension) VALUES (?1, ?2)")
        .bind(collection)
        .bind(dimension as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Storage(format!("collection insert: {e}")))?;
    Ok(())
}

async fn write_records(
    conn: &mut SqliteConnection,
    collection: &str,
    records: &[VectorRecord],
) -> Result<(), StoreError> {
    for r in records {
        let metadata = serde_json::to_string(&r.metadata)
            .map_err(|e| StoreError::Storage(format!("metadata serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO vectors (collection, id, content, metadata, embedding)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, id) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata,
                embedding = excluded.embedding
            "#,
        )
        .bind(collection)
        .bind(&r.id)
        .bind(&r.content)
        .bind(&metadata)
        .bind(vector::embedding_to_blob(&r.embedding))
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;
    }
    Ok(())
}

async fn delete_collection(conn: &mut SqliteConnection, collection: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM vectors WHERE collection = ?1")
        .bind(collection)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Storage(format!("clear vectors: {e}")))?;
    sqlx::query("DELETE FROM collections WHERE name = ?1")
        .bind(collection)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Storage(format!("clear collection: {e}")))?;
    Ok(())
}

/// A persistent vector store.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let pool = open_pool(path).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite vector store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name       TEXT PRIMARY KEY,
                dimension  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("collections table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                collection  TEXT NOT NULL,
                id          TEXT NOT NULL,
                content     TEXT NOT NULL,
                metadata    TEXT NOT NULL DEFAULT '{}',
                embedding   BLOB NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("vectors table: {e}")))?;

        debug!("SQLite vector migrations complete");
        Ok(())
    }

    async fn dimension(&self, collection: &str) -> Result<Option<usize>, StoreError> {
        let row = sqlx::query("SELECT dimension FROM collections WHERE name = ?1")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("dimension lookup: {e}")))?;
        Ok(row.map(|r| r.get::<i64, _>("dimension") as usize))
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord, StoreError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        let metadata_json: String = row
            .try_get("metadata")
            .map_err(|e| StoreError::QueryFailed(format!("metadata column: {e}")))?;
        let blob: Vec<u8> = row
            .try_get("embedding")
            .map_err(|e| StoreError::QueryFailed(format!("embedding column: {e}")))?;

        Ok(VectorRecord {
            id,
            content,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            embedding: vector::blob_to_embedding(&blob),
        })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;

        let fixed = sqlx::query("SELECT dimension FROM collections WHERE name = ?1")
            .bind(collection)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("dimension lookup: {e}")))?
            .map(|r| r.get::<i64, _>("dimension") as usize);

        let dimension = check_dimension(collection, fixed, &records)?;
        if fixed.is_none() {
            if let Some(d) = dimension {
                fix_dimension(&mut *tx, collection, d).await?;
            }
        }

        write_records(&mut *tx, collection, &records).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;

        debug!(collection, count = records.len(), "Upserted vectors");
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        if let Some(d) = self.dimension(collection).await?.filter(|d| *d != embedding.len()) {
            return Err(StoreError::DimensionMismatch {
                collection: collection.into(),
                expected: d,
                actual: embedding.len(),
            });
        }

        let rows = sqlx::query("SELECT id, content, metadata, embedding FROM vectors WHERE collection = ?1")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("vector scan: {e}")))?;

        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vector::rank(&records, embedding, k, filter))
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vectors WHERE collection = ?1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("count: {e}")))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM vectors WHERE collection = ?1 AND id = ?2")
                .bind(collection)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;
            removed += result.rows_affected() as usize;
        }
        Ok(removed)
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;
        delete_collection(&mut *tx, collection).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;
        Ok(())
    }

    async fn replace(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        let dimension = check_dimension(collection, None, &records)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;
        delete_collection(&mut *tx, collection).await?;
        if let Some(d) = dimension {
            fix_dimension(&mut *tx, collection, d).await?;
        }
        write_records(&mut *tx, collection, &records).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;

        debug!(collection, count = records.len(), "Replaced collection");
        Ok(())
    }
}
