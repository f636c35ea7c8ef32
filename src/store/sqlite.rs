//! SQLite-backed [`DocumentStore`].
//!
//! Vectors are stored as little-endian f32 BLOBs next to their chunk text.
//! Timestamps are Unix seconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{validate_batch, DocumentStore};
use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::migrate;
use crate::models::{Chunk, DocumentSummary, SourceDocument};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_chunks(&self, doc: &SourceDocument, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM chunks WHERE document_id != ? LIMIT 1")
                .bind(&doc.id)
                .fetch_optional(&mut *tx)
                .await?;
        validate_batch(doc, chunks, existing.map(|d| d as usize))?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, mime_type, modified_at, size, parent, web_link, imported_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                mime_type = excluded.mime_type,
                modified_at = excluded.modified_at,
                size = excluded.size,
                parent = excluded.parent,
                web_link = excluded.web_link,
                imported_at = excluded.imported_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.name)
        .bind(&doc.mime_type)
        .bind(doc.modified_at.map(|t| t.timestamp()))
        .bind(doc.size.map(|s| s as i64))
        .bind(&doc.parent)
        .bind(&doc.web_link)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, chunk_index, text, vector, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(vec_to_blob(&chunk.vector))
            .bind(chunk.vector.len() as i64)
            .bind(chunk.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.document_id, d.name, c.chunk_index, c.text, c.vector, c.created_at
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            ORDER BY c.seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let chunks = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                Chunk {
                    document_id: row.get("document_id"),
                    document_name: row.get("name"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                    created_at: from_ts(row.get("created_at")),
                }
            })
            .collect();
        Ok(chunks)
    }

    async fn purge(&self, document_id: &str) -> Result<bool> {
        // Chunks go with the document through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.name, d.mime_type, d.web_link, d.imported_at,
                   COUNT(c.seq) AS chunk_count
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            GROUP BY d.id
            ORDER BY d.imported_at DESC, d.name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentSummary {
                id: row.get("id"),
                name: row.get("name"),
                mime_type: row.get("mime_type"),
                web_link: row.get("web_link"),
                chunk_count: row.get("chunk_count"),
                imported_at: from_ts(row.get("imported_at")),
            })
            .collect())
    }

    async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunks LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(dims.map(|d| d as usize))
    }
}
