//! Content-addressed document store.
//!
//! Documents are keyed by (project, content_hash) where the hash covers the
//! extracted text, so identical content within a project deduplicates to a
//! single row and the text is stored exactly once. Re-fetching a known URL
//! with changed content updates the row in place (bumping `fetched_at`,
//! which queues it for reindexing); deletion removes the document's chunks
//! before the document itself so retrieval never observes an orphan.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunk::hash_text;
use crate::error::{Error, Result};
use crate::models::{Document, DocumentOrigin};

/// Fields supplied when inserting extracted content.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source_url: Option<String>,
    pub origin: DocumentOrigin,
    pub mime: String,
    pub title: Option<String>,
    pub text: String,
    pub description: Option<String>,
    pub priority: f64,
    /// Original bytes for binary formats; text formats store nothing.
    pub blob: Option<Vec<u8>>,
}

/// Outcome of an upsert, used by the crawler for progress accounting and by
/// the indexer to decide whether reindexing is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New content: a fresh document row was created.
    Created(String),
    /// A known URL changed: the existing row was updated in place.
    Updated(String),
    /// Identical content already stored; nothing written.
    Unchanged(String),
}

impl UpsertOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id)
            | UpsertOutcome::Updated(id)
            | UpsertOutcome::Unchanged(id) => id,
        }
    }

    /// True when the indexer has new work for this document.
    pub fn changed(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged(_))
    }
}

/// Insert or update a document for `project`. Dedup is stable: identical
/// extracted text yields the same document id on every call.
pub async fn upsert_document(
    pool: &SqlitePool,
    project: &str,
    doc: NewDocument,
) -> Result<UpsertOutcome> {
    if doc.text.trim().is_empty() {
        return Err(Error::validation("text", "document text must not be empty"));
    }
    let content_hash = hash_text(&doc.text);
    let now = Utc::now().timestamp();

    // Identical content already present: nothing to write.
    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM documents WHERE project_slug = ? AND content_hash = ?",
    )
    .bind(project)
    .bind(&content_hash)
    .fetch_optional(pool)
    .await?;
    if let Some(id) = existing {
        return Ok(UpsertOutcome::Unchanged(id));
    }

    // A known URL whose content changed: replace the text in place.
    if let Some(ref url) = doc.source_url {
        let by_url: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE project_slug = ? AND source_url = ?")
                .bind(project)
                .bind(url)
                .fetch_optional(pool)
                .await?;
        if let Some(id) = by_url {
            sqlx::query(
                r#"
                UPDATE documents
                SET content_hash = ?, mime = ?, title = COALESCE(?, title),
                    text = ?, description = COALESCE(?, description),
                    fetched_at = ?, pruned = 0
                WHERE id = ?
                "#,
            )
            .bind(&content_hash)
            .bind(&doc.mime)
            .bind(&doc.title)
            .bind(&doc.text)
            .bind(&doc.description)
            .bind(now)
            .bind(&id)
            .execute(pool)
            .await?;
            store_blob(pool, &id, doc.blob.as_deref()).await?;
            return Ok(UpsertOutcome::Updated(id));
        }
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO documents (id, project_slug, content_hash, source_url, origin, mime,
            title, text, description, priority, fetched_at, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(&id)
    .bind(project)
    .bind(&content_hash)
    .bind(&doc.source_url)
    .bind(doc.origin.as_str())
    .bind(&doc.mime)
    .bind(&doc.title)
    .bind(&doc.text)
    .bind(&doc.description)
    .bind(doc.priority)
    .bind(now)
    .execute(pool)
    .await?;
    store_blob(pool, &id, doc.blob.as_deref()).await?;

    Ok(UpsertOutcome::Created(id))
}

async fn store_blob(pool: &SqlitePool, document_id: &str, blob: Option<&[u8]>) -> Result<()> {
    if let Some(bytes) = blob {
        sqlx::query(
            r#"
            INSERT INTO document_blobs (document_id, bytes) VALUES (?, ?)
            ON CONFLICT(document_id) DO UPDATE SET bytes = excluded.bytes
            "#,
        )
        .bind(document_id)
        .bind(bytes)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_document(&r)))
}

pub async fn get_blob(pool: &SqlitePool, document_id: &str) -> Result<Option<Vec<u8>>> {
    let bytes: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT bytes FROM document_blobs WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    Ok(bytes)
}

/// Projection row for the admin knowledge list.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMeta {
    pub id: String,
    pub source_url: Option<String>,
    pub origin: String,
    pub mime: String,
    pub title: Option<String>,
    pub size_bytes: i64,
    pub priority: f64,
    pub fetched_at: i64,
    pub indexed_at: Option<i64>,
}

pub async fn list_documents(pool: &SqlitePool, project: &str) -> Result<Vec<DocumentMeta>> {
    let rows = sqlx::query(
        r#"
        SELECT id, source_url, origin, mime, title, LENGTH(text) AS size_bytes,
               priority, fetched_at, indexed_at
        FROM documents
        WHERE project_slug = ? AND pruned = 0
        ORDER BY fetched_at DESC
        "#,
    )
    .bind(project)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| DocumentMeta {
            id: r.get("id"),
            source_url: r.get("source_url"),
            origin: r.get("origin"),
            mime: r.get("mime"),
            title: r.get("title"),
            size_bytes: r.get("size_bytes"),
            priority: r.get("priority"),
            fetched_at: r.get("fetched_at"),
            indexed_at: r.get("indexed_at"),
        })
        .collect())
}

/// Documents awaiting (re)indexing, oldest first. This order is the
/// worker's observation order within a project.
pub async fn pending_documents(
    pool: &SqlitePool,
    project: &str,
    limit: i64,
) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM documents
        WHERE project_slug = ? AND pruned = 0
          AND (indexed_at IS NULL OR indexed_at < fetched_at)
        ORDER BY fetched_at ASC
        LIMIT ?
        "#,
    )
    .bind(project)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_document).collect())
}

/// Projects that currently have pending documents.
pub async fn projects_with_pending(pool: &SqlitePool) -> Result<Vec<String>> {
    let slugs: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT project_slug FROM documents
        WHERE pruned = 0 AND (indexed_at IS NULL OR indexed_at < fetched_at)
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(slugs)
}

/// Delete a document and everything derived from it. Chunks and index
/// entries are removed in the same transaction, before the document row.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<()> {
    let doc = get_document(pool, id)
        .await?
        .ok_or_else(|| Error::validation("id", "document not found"))?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_blobs WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let origin: String = row.get("origin");
    Document {
        id: row.get("id"),
        project_slug: row.get("project_slug"),
        content_hash: row.get("content_hash"),
        source_url: row.get("source_url"),
        origin: DocumentOrigin::parse(&origin),
        mime: row.get("mime"),
        title: row.get("title"),
        text: row.get("text"),
        description: row.get("description"),
        priority: row.get("priority"),
        fetched_at: row.get("fetched_at"),
        indexed_at: row.get("indexed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, pool)
    }

    fn doc(text: &str, url: Option<&str>) -> NewDocument {
        NewDocument {
            source_url: url.map(String::from),
            origin: DocumentOrigin::Crawl,
            mime: "text/plain".into(),
            title: None,
            text: text.into(),
            description: None,
            priority: 0.0,
            blob: None,
        }
    }

    #[tokio::test]
    async fn test_dedup_is_stable() {
        let (_tmp, pool) = test_pool().await;
        let first = upsert_document(&pool, "demo", doc("same text", None))
            .await
            .unwrap();
        let second = upsert_document(&pool, "demo", doc("same text", None))
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Created(_)));
        assert!(matches!(second, UpsertOutcome::Unchanged(_)));
        assert_eq!(first.document_id(), second.document_id());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_same_text_different_projects_not_shared() {
        let (_tmp, pool) = test_pool().await;
        let a = upsert_document(&pool, "alpha", doc("shared text", None))
            .await
            .unwrap();
        let b = upsert_document(&pool, "beta", doc("shared text", None))
            .await
            .unwrap();
        assert!(matches!(b, UpsertOutcome::Created(_)));
        assert_ne!(a.document_id(), b.document_id());
    }

    #[tokio::test]
    async fn test_changed_url_content_updates_in_place() {
        let (_tmp, pool) = test_pool().await;
        let url = Some("https://example.test/page");
        let first = upsert_document(&pool, "demo", doc("version one", url))
            .await
            .unwrap();
        // Simulate the indexer having caught up.
        sqlx::query("UPDATE documents SET indexed_at = fetched_at + 1 WHERE id = ?")
            .bind(first.document_id())
            .execute(&pool)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let second = upsert_document(&pool, "demo", doc("version two", url))
            .await
            .unwrap();
        assert!(matches!(second, UpsertOutcome::Updated(_)));
        assert_eq!(first.document_id(), second.document_id());

        let pending = pending_documents(&pool, "demo", 10).await.unwrap();
        assert_eq!(pending.len(), 1, "updated document should need reindexing");
        assert_eq!(pending[0].text, "version two");
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let (_tmp, pool) = test_pool().await;
        let err = upsert_document(&pool, "demo", doc("   ", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_delete_removes_chunks_first() {
        let (_tmp, pool) = test_pool().await;
        let outcome = upsert_document(&pool, "demo", doc("to be deleted", None))
            .await
            .unwrap();
        let id = outcome.document_id().to_string();
        sqlx::query(
            "INSERT INTO chunks (id, document_id, project_slug, ordinal, text, text_hash)
             VALUES ('c1', ?, 'demo', 0, 'to be deleted', 'h')",
        )
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();

        delete_document(&pool, &id).await.unwrap();

        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(chunks, 0);
        assert!(get_document(&pool, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_roundtrip() {
        let (_tmp, pool) = test_pool().await;
        let mut d = doc("pdf-derived text", None);
        d.blob = Some(vec![1, 2, 3, 4]);
        d.mime = "application/pdf".into();
        let outcome = upsert_document(&pool, "demo", d).await.unwrap();
        let blob = get_blob(&pool, outcome.document_id()).await.unwrap();
        assert_eq!(blob, Some(vec![1, 2, 3, 4]));
    }
}
