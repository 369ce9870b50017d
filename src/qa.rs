//! Curated QA pairs: exact and semantic short-circuit knowledge.
//!
//! A QA pair is matched before retrieval runs; an exact normalized match or
//! a high-similarity embedding match returns the curated answer with
//! maximum score. Pairs arrive one at a time through the admin API or in
//! bulk via CSV/XLSX upload, deduplicated by normalized question hash.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunk::hash_text;
use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::extract;
use crate::models::QaPair;

/// Field caps for bulk import; longer values are truncated and counted.
pub const MAX_QUESTION_CHARS: usize = 1000;
pub const MAX_ANSWER_CHARS: usize = 10_000;
/// Row cap per upload.
pub const MAX_IMPORT_ROWS: usize = 50_000;

/// Normalize a question for dedup and exact matching: lowercase, strip
/// punctuation, collapse whitespace.
pub fn normalize_question(q: &str) -> String {
    q.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn question_hash(q: &str) -> String {
    hash_text(&normalize_question(q))
}

pub async fn add_qa(
    pool: &SqlitePool,
    project: &str,
    question: &str,
    answer: &str,
    priority: f64,
) -> Result<QaPair> {
    if question.trim().is_empty() {
        return Err(Error::validation("question", "must not be empty"));
    }
    if answer.trim().is_empty() {
        return Err(Error::validation("answer", "must not be empty"));
    }

    let hash = question_hash(question);
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM qa_pairs WHERE project_slug = ? AND question_hash = ?")
            .bind(project)
            .bind(&hash)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Err(Error::conflict("an equivalent question already exists"));
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO qa_pairs (id, project_slug, question, answer, priority, question_hash)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(project)
    .bind(question)
    .bind(answer)
    .bind(priority)
    .bind(&hash)
    .execute(pool)
    .await?;

    Ok(QaPair {
        id,
        project_slug: project.to_string(),
        question: question.to_string(),
        answer: answer.to_string(),
        priority,
    })
}

pub async fn list_qa(pool: &SqlitePool, project: &str) -> Result<Vec<QaPair>> {
    let rows = sqlx::query(
        "SELECT id, project_slug, question, answer, priority
         FROM qa_pairs WHERE project_slug = ? ORDER BY priority DESC, question",
    )
    .bind(project)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| QaPair {
            id: r.get("id"),
            project_slug: r.get("project_slug"),
            question: r.get("question"),
            answer: r.get("answer"),
            priority: r.get("priority"),
        })
        .collect())
}

pub async fn delete_qa(pool: &SqlitePool, project: &str, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM qa_pairs WHERE project_slug = ? AND id = ?")
        .bind(project)
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::validation("id", "QA pair not found"));
    }
    Ok(())
}

/// Exact-match lookup by normalized question.
pub async fn find_exact(pool: &SqlitePool, project: &str, question: &str) -> Result<Option<QaPair>> {
    let hash = question_hash(question);
    let row = sqlx::query(
        "SELECT id, project_slug, question, answer, priority
         FROM qa_pairs WHERE project_slug = ? AND question_hash = ?",
    )
    .bind(project)
    .bind(&hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| QaPair {
        id: r.get("id"),
        project_slug: r.get("project_slug"),
        question: r.get("question"),
        answer: r.get("answer"),
        priority: r.get("priority"),
    }))
}

/// Best semantic match against stored question embeddings; returns the
/// pair and its cosine similarity.
pub async fn find_semantic(
    pool: &SqlitePool,
    project: &str,
    query_vec: &[f32],
) -> Result<Option<(QaPair, f32)>> {
    let rows = sqlx::query(
        "SELECT id, project_slug, question, answer, priority, embedding
         FROM qa_pairs WHERE project_slug = ? AND embedding IS NOT NULL",
    )
    .bind(project)
    .fetch_all(pool)
    .await?;

    let mut best: Option<(QaPair, f32)> = None;
    for r in &rows {
        let blob: Vec<u8> = r.get("embedding");
        let similarity =
            crate::embedding::cosine_similarity(query_vec, &blob_to_vec(&blob));
        let better = match &best {
            Some((_, s)) => similarity > *s,
            None => true,
        };
        if better {
            best = Some((
                QaPair {
                    id: r.get("id"),
                    project_slug: r.get("project_slug"),
                    question: r.get("question"),
                    answer: r.get("answer"),
                    priority: r.get("priority"),
                },
                similarity,
            ));
        }
    }
    Ok(best)
}

/// Embed QA questions that do not yet have vectors. Called by the indexer
/// alongside document embedding; failures are non-fatal.
pub async fn embed_missing(
    pool: &SqlitePool,
    project: &str,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<u64> {
    let rows = sqlx::query(
        "SELECT id, question FROM qa_pairs WHERE project_slug = ? AND embedding IS NULL",
    )
    .bind(project)
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let mut embedded = 0u64;
    for batch in rows.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|r| r.get("question")).collect();
        let vectors = provider.embed(&texts).await?;
        for (row, vector) in batch.iter().zip(vectors.iter()) {
            let id: String = row.get("id");
            sqlx::query("UPDATE qa_pairs SET embedding = ? WHERE id = ?")
                .bind(vec_to_blob(vector))
                .bind(&id)
                .execute(pool)
                .await?;
            embedded += 1;
        }
    }
    Ok(embedded)
}

// ============ Bulk import ============

/// Outcome of a bulk upload, mirrored in the API response.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportReport {
    pub imported: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub truncated: u64,
    pub errors: Vec<String>,
}

const MAX_REPORTED_ERRORS: usize = 20;

/// Import QA rows from CSV bytes. Expected columns: question, answer,
/// optional priority. A leading header row is detected and skipped.
pub async fn import_csv(pool: &SqlitePool, project: &str, bytes: &[u8]) -> Result<ImportReport> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows: Vec<Vec<String>> = Vec::new();
    for (i, record) in reader.records().enumerate() {
        if rows.len() >= MAX_IMPORT_ROWS {
            return Err(Error::validation(
                "file",
                format!("more than {} rows", MAX_IMPORT_ROWS),
            ));
        }
        match record {
            Ok(r) => rows.push(r.iter().map(|f| f.to_string()).collect()),
            Err(e) => {
                return Err(Error::validation("file", format!("row {}: {}", i + 1, e)));
            }
        }
    }

    import_rows(pool, project, rows).await
}

/// Import QA rows from an XLSX workbook (first sheet onwards).
pub async fn import_xlsx(pool: &SqlitePool, project: &str, bytes: &[u8]) -> Result<ImportReport> {
    let rows = extract::extract_xlsx_rows(bytes)
        .map_err(|e| Error::validation("file", e.to_string()))?;
    if rows.len() > MAX_IMPORT_ROWS {
        return Err(Error::validation(
            "file",
            format!("more than {} rows", MAX_IMPORT_ROWS),
        ));
    }
    import_rows(pool, project, rows).await
}

async fn import_rows(
    pool: &SqlitePool,
    project: &str,
    rows: Vec<Vec<String>>,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for (i, row) in rows.iter().enumerate() {
        // Header detection: a first row naming the columns.
        if i == 0 {
            let first = row.first().map(|c| c.trim().to_lowercase());
            if first.as_deref() == Some("question") {
                continue;
            }
        }

        let question = row.first().map(|s| s.trim()).unwrap_or("");
        let answer = row.get(1).map(|s| s.trim()).unwrap_or("");
        if question.is_empty() || answer.is_empty() {
            report.skipped += 1;
            continue;
        }

        let (question, q_truncated) = truncate_chars(question, MAX_QUESTION_CHARS);
        let (answer, a_truncated) = truncate_chars(answer, MAX_ANSWER_CHARS);
        if q_truncated || a_truncated {
            report.truncated += 1;
        }

        let priority = row
            .get(2)
            .and_then(|p| p.trim().parse::<f64>().ok())
            .unwrap_or(1.0);

        match add_qa(pool, project, &question, &answer, priority).await {
            Ok(_) => report.imported += 1,
            Err(Error::Conflict(_)) => report.duplicates += 1,
            Err(e) => {
                if report.errors.len() < MAX_REPORTED_ERRORS {
                    report.errors.push(format!("row {}: {}", i + 1, e));
                }
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

fn truncate_chars(s: &str, max_chars: usize) -> (String, bool) {
    if s.chars().count() <= max_chars {
        (s.to_string(), false)
    } else {
        (s.chars().take(max_chars).collect(), true)
    }
}
