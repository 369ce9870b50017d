//! Vector and lexical index over chunks, partitioned per project.
//!
//! The lexical side is an FTS5 virtual table with BM25 ranking; the vector
//! side stores embedding BLOBs scanned with cosine similarity. Writes for a
//! document replace all of its chunks, FTS rows and vectors in a single
//! transaction and stamp `indexed_at` in the same commit, so readers see
//! either the old generation or the new one, never a chunk present in one
//! index but not the other.
//!
//! Indices are single-writer per project (the embedding worker) and
//! many-reader (the retriever).

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::Chunk;

/// A candidate chunk from either index, before fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw engine score: negated BM25 rank or cosine similarity.
    pub raw_score: f64,
    pub excerpt: String,
    /// SHA-256 of the chunk text, for cross-list deduplication.
    pub text_hash: String,
}

/// Embeddings to publish alongside chunks; `None` only when the embedding
/// provider is configured off (lexical-only corpus).
pub struct ChunkVectors<'a> {
    pub vectors: &'a [Vec<f32>],
    pub model: &'a str,
    pub dims: usize,
}

/// Atomically replace a document's chunks in both indices and stamp its
/// indexing checkpoint.
pub async fn publish_chunks(
    pool: &SqlitePool,
    project: &str,
    document_id: &str,
    chunks: &[Chunk],
    vectors: Option<ChunkVectors<'_>>,
) -> Result<()> {
    if let Some(ref v) = vectors {
        if v.vectors.len() != chunks.len() {
            return Err(Error::internal(format!(
                "vector count {} does not match chunk count {}",
                v.vectors.len(),
                chunks.len()
            )));
        }
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (i, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, project_slug, ordinal, text, text_hash)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(document_id)
        .bind(project)
        .bind(chunk.ordinal)
        .bind(&chunk.text)
        .bind(&chunk.text_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, document_id, project_slug, text)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(document_id)
        .bind(project)
        .bind(&chunk.text)
        .execute(&mut *tx)
        .await?;

        if let Some(ref v) = vectors {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, project_slug, model, dims, embedding)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(project)
            .bind(v.model)
            .bind(v.dims as i64)
            .bind(vec_to_blob(&v.vectors[i]))
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query("UPDATE documents SET indexed_at = ? WHERE id = ?")
        .bind(now)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Remove a document's chunks from both indices (pruning path; the
/// document row itself is retained).
pub async fn remove_document_chunks(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Build an FTS5 query from free text: alphanumeric tokens, quoted, joined
/// with OR. Natural-language questions rarely match every token, so OR
/// with BM25 ranking beats the implicit-AND default.
pub fn fts_query(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Fetch lexical candidates via FTS5/BM25, scoped to `project`.
pub async fn lexical_candidates(
    pool: &SqlitePool,
    project: &str,
    query: &str,
    k: i64,
) -> Result<Vec<Candidate>> {
    let match_expr = fts_query(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.document_id AS document_id,
               rank, snippet(chunks_fts, 3, '', '', '…', 32) AS excerpt,
               c.text_hash AS text_hash
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ? AND chunks_fts.project_slug = ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(project)
    .bind(k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            Candidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                // FTS5 rank is negative (lower = better); negate to score.
                raw_score: -rank,
                excerpt: row.get("excerpt"),
                text_hash: row.get("text_hash"),
            }
        })
        .collect())
}

/// Fetch dense candidates by brute-force cosine scan over the project's
/// vectors.
pub async fn dense_candidates(
    pool: &SqlitePool,
    project: &str,
    query_vec: &[f32],
    k: i64,
) -> Result<Vec<Candidate>> {
    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               substr(c.text, 1, 240) AS excerpt, c.text_hash
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        WHERE cv.project_slug = ?
        "#,
    )
    .bind(project)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<Candidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            Candidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: cosine_similarity(query_vec, &vec) as f64,
                excerpt: row.get("excerpt"),
                text_hash: row.get("text_hash"),
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(k as usize);
    Ok(candidates)
}

/// Number of vectors stored for a project; `None` probes the whole index.
pub async fn vector_count(pool: &SqlitePool, project: Option<&str>) -> Result<i64> {
    let count: i64 = match project {
        Some(p) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE project_slug = ?")
                .bind(p)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::{db, migrate};

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, pool)
    }

    async fn seed_document(pool: &SqlitePool, project: &str, id: &str, text: &str) {
        sqlx::query(
            "INSERT INTO documents (id, project_slug, content_hash, mime, text, fetched_at)
             VALUES (?, ?, ?, 'text/plain', ?, 1)",
        )
        .bind(id)
        .bind(project)
        .bind(crate::chunk::hash_text(text))
        .bind(text)
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn test_fts_query_sanitizes() {
        assert_eq!(fts_query("what is rust?"), "\"what\" OR \"is\" OR \"rust\"");
        assert_eq!(fts_query("\"quoted\" (parens)"), "\"quoted\" OR \"parens\"");
        assert_eq!(fts_query("!!!"), "");
    }

    #[tokio::test]
    async fn test_publish_then_lexical_search() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "demo", "d1", "The capital of Atlantis is Sunhaven.").await;
        let chunks = chunk_text("d1", "The capital of Atlantis is Sunhaven.", 700, 0);
        publish_chunks(&pool, "demo", "d1", &chunks, None)
            .await
            .unwrap();

        let hits = lexical_candidates(&pool, "demo", "capital of Atlantis", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
    }

    #[tokio::test]
    async fn test_search_is_project_scoped() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "alpha", "d1", "Atlantis facts here.").await;
        let chunks = chunk_text("d1", "Atlantis facts here.", 700, 0);
        publish_chunks(&pool, "alpha", "d1", &chunks, None)
            .await
            .unwrap();

        let other = lexical_candidates(&pool, "beta", "Atlantis", 10)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_publish_with_vectors_enables_dense_search() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "demo", "d1", "First topic.\n\nSecond topic.").await;
        let chunks = chunk_text("d1", "First topic.\n\nSecond topic.", 2, 0);
        let vectors: Vec<Vec<f32>> = (0..chunks.len())
            .map(|i| if i == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
            .collect();
        publish_chunks(
            &pool,
            "demo",
            "d1",
            &chunks,
            Some(ChunkVectors {
                vectors: &vectors,
                model: "test",
                dims: 2,
            }),
        )
        .await
        .unwrap();

        let hits = dense_candidates(&pool, "demo", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunks[0].id);
        assert!(hits[0].raw_score > 0.99);
    }

    #[tokio::test]
    async fn test_republish_replaces_old_generation() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "demo", "d1", "Old text about ships.").await;
        let old = chunk_text("d1", "Old text about ships.", 700, 0);
        publish_chunks(&pool, "demo", "d1", &old, None).await.unwrap();

        let new = chunk_text("d1", "New text about planes.", 700, 0);
        publish_chunks(&pool, "demo", "d1", &new, None).await.unwrap();

        let ships = lexical_candidates(&pool, "demo", "ships", 10).await.unwrap();
        assert!(ships.is_empty());
        let planes = lexical_candidates(&pool, "demo", "planes", 10).await.unwrap();
        assert_eq!(planes.len(), 1);

        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(chunk_count, 1);
    }

    #[tokio::test]
    async fn test_vector_chunk_count_mismatch_rejected() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "demo", "d1", "Some text.").await;
        let chunks = chunk_text("d1", "Some text.", 700, 0);
        let vectors = vec![vec![1.0f32], vec![2.0f32]];
        let err = publish_chunks(
            &pool,
            "demo",
            "d1",
            &chunks,
            Some(ChunkVectors {
                vectors: &vectors,
                model: "test",
                dims: 1,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "internal");
    }

    #[tokio::test]
    async fn test_publish_stamps_indexed_at() {
        let (_tmp, pool) = test_pool().await;
        seed_document(&pool, "demo", "d1", "Fresh content.").await;
        let chunks = chunk_text("d1", "Fresh content.", 700, 0);
        publish_chunks(&pool, "demo", "d1", &chunks, None).await.unwrap();

        let indexed_at: Option<i64> =
            sqlx::query_scalar("SELECT indexed_at FROM documents WHERE id = 'd1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(indexed_at.is_some());
    }
}
