//! Document and chunk persistence.
//!
//! All multi-statement changes run in one transaction so readers never see
//! a document with half of its chunk set replaced.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::embedding::format_vector;
use crate::error::{PipelineError, Result};
use crate::models::{Chunk, Document, DocumentMeta, DocumentStatus, Scope};

const DOCUMENT_COLUMNS: &str = "id, source_id, scope, title, storage_path, relative_path, status, meta, expires_at, deleted_at, created_at";

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    pub async fn require(&self, id: &str) -> Result<Document> {
        self.get(id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))
    }

    /// Insert a queued `temp` document that expires after `ttl_hours`.
    pub async fn create_temp(
        &self,
        title: &str,
        storage_path: &str,
        ttl_hours: i64,
    ) -> Result<Document> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = (now + ChronoDuration::hours(ttl_hours)).timestamp();

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, scope, title, storage_path, relative_path, status, meta, expires_at, created_at)
            VALUES (?, NULL, 'temp', ?, ?, ?, 'queued', '{}', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(title)
        .bind(storage_path)
        .bind(title)
        .bind(expires_at)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        self.require(&id).await
    }

    /// Find the document for `(source_id, relative_path)`, creating it if absent.
    /// Returns the document and whether it was created.
    pub async fn locate_or_create(
        &self,
        source_id: i64,
        relative_path: &str,
        storage_path: &str,
    ) -> Result<(Document, bool)> {
        let existing = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_id = ? AND relative_path = ?"
        ))
        .bind(source_id)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok((row_to_document(&row)?, false));
        }

        let id = Uuid::new_v4().to_string();
        let title = std::path::Path::new(relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| relative_path.to_string());

        // A concurrent scan may have inserted the same key; the unique index wins.
        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, scope, title, storage_path, relative_path, status, meta, created_at)
            VALUES (?, ?, 'nas', ?, ?, ?, 'queued', '{}', ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(source_id)
        .bind(&title)
        .bind(storage_path)
        .bind(relative_path)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_id = ? AND relative_path = ?"
        ))
        .bind(source_id)
        .bind(relative_path)
        .fetch_one(&self.pool)
        .await?;
        let doc = row_to_document(&row)?;
        let created = doc.id == id;
        Ok((doc, created))
    }

    /// Record the file's current location and requeue the document. Chunks
    /// and fingerprint are left for [`DocumentStore::complete_ingest`].
    pub async fn requeue(&self, id: &str, storage_path: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET storage_path = ?, status = 'queued', deleted_at = NULL WHERE id = ?",
        )
        .bind(storage_path)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace the document's chunks, merge `update` into its metadata, and
    /// mark it `ready`, atomically.
    pub async fn complete_ingest<F>(
        &self,
        id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
        update: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut DocumentMeta),
    {
        if chunks.len() != embeddings.len() {
            return Err(PipelineError::Embedding(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let mut tx = self.pool.begin().await?;
        let mut meta = load_meta(&mut tx, id).await?;
        update(&mut meta);

        delete_chunks(&mut tx, id).await?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            let chunk_meta = serde_json::json!({ "page_or_sheet": chunk.page_or_sheet });
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content, embedding, hash, meta) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(format_vector(embedding))
            .bind(&chunk.hash)
            .bind(chunk_meta.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE documents SET meta = ?, status = 'ready' WHERE id = ?")
            .bind(serde_json::to_string(&meta)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark the document `failed` and record the reason in its metadata.
    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut meta = load_meta(&mut tx, id).await?;
        meta.extra
            .insert("error".to_string(), serde_json::Value::String(message.to_string()));
        sqlx::query("UPDATE documents SET meta = ?, status = 'failed' WHERE id = ?")
            .bind(serde_json::to_string(&meta)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Chunks of a document, in index order.
    pub async fn chunks(&self, id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, hash, meta FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Soft-delete temp documents whose expiry is at or before `now`.
    pub async fn cleanup_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE documents SET deleted_at = ? WHERE scope = 'temp' AND expires_at <= ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn load_meta(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<DocumentMeta> {
    let raw: Option<String> = sqlx::query_scalar("SELECT meta FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    let raw = raw.ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))?;
    Ok(DocumentMeta::from_json(&raw)?)
}

async fn delete_chunks(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let meta: String = row.get("meta");
    let page_or_sheet = serde_json::from_str::<serde_json::Value>(&meta)
        .ok()
        .and_then(|v| v.get("page_or_sheet").and_then(|p| p.as_str()).map(String::from));
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        hash: row.get("hash"),
        page_or_sheet,
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let scope: String = row.get("scope");
    let status: String = row.get("status");
    let meta: String = row.get("meta");
    Ok(Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        scope: Scope::parse(&scope).unwrap_or(Scope::Nas),
        title: row.get("title"),
        storage_path: row.get("storage_path"),
        relative_path: row.get("relative_path"),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
        meta: DocumentMeta::from_json(&meta)?,
        expires_at: row.get("expires_at"),
        deleted_at: row.get("deleted_at"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::db;
    use crate::migrate;
    use crate::models::Fingerprint;

    async fn store() -> (tempfile::TempDir, DocumentStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("docs.sqlite")).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        sqlx::query("INSERT INTO sources (id, base_path, enabled, created_at) VALUES (1, 'dept', 1, 0)")
            .execute(&pool)
            .await
            .unwrap();
        (tmp, DocumentStore::new(pool))
    }

    #[tokio::test]
    async fn temp_documents_carry_expiry() {
        let (_tmp, docs) = store().await;
        let doc = docs.create_temp("memo.txt", "/uploads/memo.txt", 24).await.unwrap();
        assert_eq!(doc.scope, Scope::Temp);
        assert_eq!(doc.status, DocumentStatus::Queued);
        let expires = doc.expires_at.unwrap();
        assert!((expires - doc.created_at - 24 * 3600).abs() <= 1);
    }

    #[tokio::test]
    async fn locate_or_create_is_keyed_by_source_and_path() {
        let (_tmp, docs) = store().await;
        let (a, created_a) = docs.locate_or_create(1, "a/report.pdf", "/mnt/nas/dept/a/report.pdf").await.unwrap();
        let (b, created_b) = docs.locate_or_create(1, "a/report.pdf", "/mnt/nas/dept/a/report.pdf").await.unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_eq!(a.title, "report.pdf");
        assert_eq!(a.scope, Scope::Nas);
    }

    #[tokio::test]
    async fn complete_ingest_replaces_chunks_and_merges_meta() {
        let (_tmp, docs) = store().await;
        let (doc, _) = docs.locate_or_create(1, "x.txt", "/mnt/nas/dept/x.txt").await.unwrap();
        docs.requeue(&doc.id, "/mnt/nas/dept/x.txt").await.unwrap();

        let first = chunk_text(&doc.id, &"a".repeat(30), 10, 0, &[]);
        let vectors = vec![vec![1.0, 0.0]; first.len()];
        docs.complete_ingest(&doc.id, &first, &vectors, |m| {
            m.quality_score = Some(0.2);
            m.fingerprint = Some(Fingerprint { mtime_ms: 5, size_bytes: 10 });
        })
        .await
        .unwrap();
        assert_eq!(docs.chunks(&doc.id).await.unwrap().len(), 3);

        let second = chunk_text(&doc.id, "short", 10, 0, &[]);
        docs.complete_ingest(&doc.id, &second, &[vec![0.0, 1.0]], |m| {
            m.quality_score = Some(0.9);
            m.warnings.push("w".into());
        })
        .await
        .unwrap();

        let stored = docs.chunks(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "short");

        let doc = docs.require(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.meta.quality_score, Some(0.9));
        assert_eq!(doc.meta.fingerprint, Some(Fingerprint { mtime_ms: 5, size_bytes: 10 }));
    }

    #[tokio::test]
    async fn requeue_keeps_chunks_and_fingerprint() {
        let (_tmp, docs) = store().await;
        let (doc, _) = docs.locate_or_create(1, "y.txt", "/mnt/nas/dept/y.txt").await.unwrap();
        let chunks = chunk_text(&doc.id, "kept text", 10, 0, &[]);
        docs.complete_ingest(&doc.id, &chunks, &[vec![1.0, 0.0]], |m| {
            m.fingerprint = Some(Fingerprint { mtime_ms: 1, size_bytes: 9 });
        })
        .await
        .unwrap();

        docs.requeue(&doc.id, "/mnt/nas/dept/moved/y.txt").await.unwrap();
        docs.mark_failed(&doc.id, "embedder down").await.unwrap();

        let doc = docs.require(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.storage_path, "/mnt/nas/dept/moved/y.txt");
        assert_eq!(doc.meta.fingerprint, Some(Fingerprint { mtime_ms: 1, size_bytes: 9 }));
        assert_eq!(docs.chunks(&doc.id).await.unwrap().len(), 1);

        assert!(matches!(
            docs.requeue("nope", "/x").await.unwrap_err(),
            PipelineError::DocumentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn corrupt_meta_is_an_error() {
        let (_tmp, docs) = store().await;
        let doc = docs.create_temp("a.txt", "/u/a.txt", 1).await.unwrap();
        sqlx::query("UPDATE documents SET meta = '{broken' WHERE id = ?")
            .bind(&doc.id)
            .execute(&docs.pool)
            .await
            .unwrap();

        assert!(matches!(docs.get(&doc.id).await.unwrap_err(), PipelineError::Json(_)));
        assert!(matches!(
            docs.mark_failed(&doc.id, "x").await.unwrap_err(),
            PipelineError::Json(_)
        ));
    }

    #[tokio::test]
    async fn mismatched_embeddings_rejected() {
        let (_tmp, docs) = store().await;
        let doc = docs.create_temp("a.txt", "/u/a.txt", 1).await.unwrap();
        let chunks = chunk_text(&doc.id, "abc", 10, 0, &[]);
        let err = docs.complete_ingest(&doc.id, &chunks, &[], |_| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }

    #[tokio::test]
    async fn cleanup_soft_deletes_only_expired_temp() {
        let (_tmp, docs) = store().await;
        let expired = docs.create_temp("old.txt", "/u/old.txt", -1).await.unwrap();
        let fresh = docs.create_temp("new.txt", "/u/new.txt", 24).await.unwrap();
        let (nas, _) = docs.locate_or_create(1, "n.txt", "/mnt/nas/dept/n.txt").await.unwrap();

        let swept = docs.cleanup_expired(Utc::now().timestamp()).await.unwrap();
        assert_eq!(swept, 1);
        assert!(docs.require(&expired.id).await.unwrap().deleted_at.is_some());
        assert!(docs.require(&fresh.id).await.unwrap().deleted_at.is_none());
        assert!(docs.require(&nas.id).await.unwrap().deleted_at.is_none());

        // second sweep is a no-op
        assert_eq!(docs.cleanup_expired(Utc::now().timestamp()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_document_errors() {
        let (_tmp, docs) = store().await;
        assert!(matches!(
            docs.set_status("nope", DocumentStatus::Running).await.unwrap_err(),
            PipelineError::DocumentNotFound(_)
        ));
    }
}
