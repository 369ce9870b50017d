//! Per-project request statistics and unanswered-question capture.
//!
//! `request_stats_daily` is an append-only counter keyed by (project, day).
//! Questions the orchestrator could not ground in the corpus are stored
//! for later curation into QA pairs.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;

/// Bump today's served-request counter for a project.
pub async fn increment_request_count(pool: &SqlitePool, project: &str) -> Result<()> {
    let day = Utc::now().format("%Y-%m-%d").to_string();
    sqlx::query(
        r#"
        INSERT INTO request_stats_daily (project_slug, day, count) VALUES (?, ?, 1)
        ON CONFLICT(project_slug, day) DO UPDATE SET count = count + 1
        "#,
    )
    .bind(project)
    .bind(&day)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub day: String,
    pub count: i64,
}

pub async fn request_counts(
    pool: &SqlitePool,
    project: &str,
    days: i64,
) -> Result<Vec<DailyCount>> {
    let rows = sqlx::query(
        "SELECT day, count FROM request_stats_daily
         WHERE project_slug = ? ORDER BY day DESC LIMIT ?",
    )
    .bind(project)
    .bind(days)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| DailyCount {
            day: r.get("day"),
            count: r.get("count"),
        })
        .collect())
}

/// Record a question the corpus could not answer.
pub async fn record_unanswered(pool: &SqlitePool, project: &str, question: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO unanswered_questions (id, project_slug, question, asked_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project)
    .bind(question)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct UnansweredQuestion {
    pub id: String,
    pub question: String,
    pub asked_at: i64,
}

pub async fn list_unanswered(pool: &SqlitePool, project: &str) -> Result<Vec<UnansweredQuestion>> {
    let rows = sqlx::query(
        "SELECT id, question, asked_at FROM unanswered_questions
         WHERE project_slug = ? ORDER BY asked_at DESC",
    )
    .bind(project)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| UnansweredQuestion {
            id: r.get("id"),
            question: r.get("question"),
            asked_at: r.get("asked_at"),
        })
        .collect())
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

    #[tokio::test]
    async fn test_daily_counter_accumulates() {
        let (_tmp, pool) = test_pool().await;
        for _ in 0..3 {
            increment_request_count(&pool, "demo").await.unwrap();
        }
        increment_request_count(&pool, "other").await.unwrap();

        let counts = request_counts(&pool, "demo", 7).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 3);
    }

    #[tokio::test]
    async fn test_unanswered_roundtrip() {
        let (_tmp, pool) = test_pool().await;
        record_unanswered(&pool, "demo", "Who invented tea?")
            .await
            .unwrap();
        let list = list_unanswered(&pool, "demo").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].question, "Who invented tea?");

        let other = list_unanswered(&pool, "other").await.unwrap();
        assert!(other.is_empty());
    }
}
