//! Database schema migrations.
//!
//! Creates every table the platform persists (projects, documents, blobs,
//! chunks, FTS5 index, vectors, QA pairs, crawl jobs, voice sessions, audio
//! cache, stats, LLM servers, action jobs) and ensures idempotent execution.
//! Designed to be run via `ans init`; `serve` also runs it at startup.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            slug TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            domain TEXT,
            llm_model TEXT,
            system_prompt TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            emotions_enabled INTEGER NOT NULL DEFAULT 0,
            voice_enabled INTEGER NOT NULL DEFAULT 0,
            sources_enabled INTEGER NOT NULL DEFAULT 1,
            captions_enabled INTEGER NOT NULL DEFAULT 0,
            debug_enabled INTEGER NOT NULL DEFAULT 0,
            crm_webhook_url TEXT,
            mail_webhook_url TEXT,
            bot_token TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            source_url TEXT,
            origin TEXT NOT NULL DEFAULT 'crawl',
            mime TEXT NOT NULL DEFAULT 'text/plain',
            title TEXT,
            text TEXT NOT NULL,
            description TEXT,
            priority REAL NOT NULL DEFAULT 0,
            fetched_at INTEGER NOT NULL,
            indexed_at INTEGER,
            pruned INTEGER NOT NULL DEFAULT 0,
            UNIQUE(project_slug, content_hash),
            FOREIGN KEY (project_slug) REFERENCES projects(slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_documents_pending
        ON documents(project_slug, fetched_at)
        WHERE indexed_at IS NULL OR indexed_at < fetched_at
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_blobs (
            document_id TEXT PRIMARY KEY,
            bytes BLOB NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            project_slug TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            UNIQUE(document_id, ordinal),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual tables are not idempotent natively, check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                project_slug UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            project_slug TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_chunk_vectors_project
        ON chunk_vectors(project_slug)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qa_pairs (
            id TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            priority REAL NOT NULL DEFAULT 1,
            question_hash TEXT NOT NULL,
            embedding BLOB,
            UNIQUE(project_slug, question_hash),
            FOREIGN KEY (project_slug) REFERENCES projects(slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unanswered_questions (
            id TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            question TEXT NOT NULL,
            asked_at INTEGER NOT NULL,
            FOREIGN KEY (project_slug) REFERENCES projects(slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_jobs (
            id TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            seed_url TEXT NOT NULL,
            max_depth INTEGER NOT NULL,
            max_pages INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            queued INTEGER NOT NULL DEFAULT 0,
            in_progress INTEGER NOT NULL DEFAULT 0,
            done INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            last_url TEXT,
            last_error TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            FOREIGN KEY (project_slug) REFERENCES projects(slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_stats_daily (
            project_slug TEXT NOT NULL,
            day TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_slug, day)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_servers (
            id TEXT PRIMARY KEY,
            base_url TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS voice_sessions (
            id TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            language TEXT NOT NULL,
            options_json TEXT NOT NULL DEFAULT '{}',
            history_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            last_activity INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio_cache (
            cache_key TEXT PRIMARY KEY,
            project_slug TEXT NOT NULL,
            voice TEXT NOT NULL,
            emotion TEXT NOT NULL DEFAULT '',
            audio BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_audio_cache_expiry ON audio_cache(expires_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS action_jobs (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            project_slug TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(request_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('projects','documents','chunks','chunks_fts','chunk_vectors','qa_pairs',
              'crawl_jobs','request_stats_daily','llm_servers','voice_sessions',
              'audio_cache','action_jobs','unanswered_questions','document_blobs')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 14);
    }
}
