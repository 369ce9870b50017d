//! Project store: the tenant namespace every other table hangs off.
//!
//! Projects are created and edited by the admin surface and never deleted
//! implicitly. An explicit delete cascades to documents, chunks, indices,
//! QA pairs, stats and sessions in a single transaction, removing chunks
//! before their documents so retrieval never sees an orphaned chunk.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::Project;

/// Admin-supplied fields for create/update.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectSpec {
    pub title: Option<String>,
    pub domain: Option<String>,
    pub llm_model: Option<String>,
    pub system_prompt: Option<String>,
    pub enabled: Option<bool>,
    pub emotions_enabled: Option<bool>,
    pub voice_enabled: Option<bool>,
    pub sources_enabled: Option<bool>,
    pub captions_enabled: Option<bool>,
    pub debug_enabled: Option<bool>,
    pub crm_webhook_url: Option<String>,
    pub mail_webhook_url: Option<String>,
    pub bot_token: Option<String>,
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 64
        && slug
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_'))
}

pub async fn create_project(pool: &SqlitePool, slug: &str, spec: ProjectSpec) -> Result<Project> {
    if !valid_slug(slug) {
        return Err(Error::validation(
            "project",
            "slug must be a lowercase identifier (a-z, 0-9, -, _)",
        ));
    }

    let existing: Option<String> = sqlx::query_scalar("SELECT slug FROM projects WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(Error::conflict(format!("project '{}' already exists", slug)));
    }

    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO projects (slug, title, domain, llm_model, system_prompt, enabled,
            emotions_enabled, voice_enabled, sources_enabled, captions_enabled, debug_enabled,
            crm_webhook_url, mail_webhook_url, bot_token, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(slug)
    .bind(spec.title.clone().unwrap_or_else(|| slug.to_string()))
    .bind(&spec.domain)
    .bind(&spec.llm_model)
    .bind(&spec.system_prompt)
    .bind(spec.enabled.unwrap_or(true))
    .bind(spec.emotions_enabled.unwrap_or(false))
    .bind(spec.voice_enabled.unwrap_or(false))
    .bind(spec.sources_enabled.unwrap_or(true))
    .bind(spec.captions_enabled.unwrap_or(false))
    .bind(spec.debug_enabled.unwrap_or(false))
    .bind(&spec.crm_webhook_url)
    .bind(&spec.mail_webhook_url)
    .bind(&spec.bot_token)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_project(pool, slug)
        .await?
        .ok_or_else(|| Error::internal("project vanished after insert"))
}

pub async fn get_project(pool: &SqlitePool, slug: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_project(&r)))
}

/// Resolve a project that must exist and be able to serve chat requests.
pub async fn require_serving_project(pool: &SqlitePool, slug: &str) -> Result<Project> {
    let project = get_project(pool, slug)
        .await?
        .ok_or_else(|| Error::project_not_found(slug))?;
    if !project.enabled {
        return Err(Error::misconfigured(format!("project '{}' is disabled", slug)));
    }
    if project
        .system_prompt
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        return Err(Error::misconfigured(format!(
            "project '{}' has no system prompt",
            slug
        )));
    }
    Ok(project)
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY slug")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_project).collect())
}

pub async fn update_project(pool: &SqlitePool, slug: &str, spec: ProjectSpec) -> Result<Project> {
    let current = get_project(pool, slug)
        .await?
        .ok_or_else(|| Error::project_not_found(slug))?;

    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE projects SET title = ?, domain = ?, llm_model = ?, system_prompt = ?,
            enabled = ?, emotions_enabled = ?, voice_enabled = ?, sources_enabled = ?,
            captions_enabled = ?, debug_enabled = ?, crm_webhook_url = ?,
            mail_webhook_url = ?, bot_token = ?, updated_at = ?
        WHERE slug = ?
        "#,
    )
    .bind(spec.title.unwrap_or(current.title))
    .bind(spec.domain.or(current.domain))
    .bind(spec.llm_model.or(current.llm_model))
    .bind(spec.system_prompt.or(current.system_prompt))
    .bind(spec.enabled.unwrap_or(current.enabled))
    .bind(spec.emotions_enabled.unwrap_or(current.emotions_enabled))
    .bind(spec.voice_enabled.unwrap_or(current.voice_enabled))
    .bind(spec.sources_enabled.unwrap_or(current.sources_enabled))
    .bind(spec.captions_enabled.unwrap_or(current.captions_enabled))
    .bind(spec.debug_enabled.unwrap_or(current.debug_enabled))
    .bind(spec.crm_webhook_url.or(current.crm_webhook_url))
    .bind(spec.mail_webhook_url.or(current.mail_webhook_url))
    .bind(spec.bot_token.or(current.bot_token))
    .bind(now)
    .bind(slug)
    .execute(pool)
    .await?;

    get_project(pool, slug)
        .await?
        .ok_or_else(|| Error::internal("project vanished after update"))
}

/// Explicit delete: cascades to all project-owned rows. Chunk rows (and
/// their index entries) go before documents so the live-document invariant
/// holds at every point readers can observe.
pub async fn delete_project(pool: &SqlitePool, slug: &str) -> Result<()> {
    if get_project(pool, slug).await?.is_none() {
        return Err(Error::project_not_found(slug));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks_fts WHERE project_slug = ?")
        .bind(slug)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE project_slug = ?")
        .bind(slug)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE project_slug = ?")
        .bind(slug)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM document_blobs WHERE document_id IN
         (SELECT id FROM documents WHERE project_slug = ?)",
    )
    .bind(slug)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM documents WHERE project_slug = ?")
        .bind(slug)
        .execute(&mut *tx)
        .await?;

    for table in [
        "qa_pairs",
        "unanswered_questions",
        "crawl_jobs",
        "request_stats_daily",
        "voice_sessions",
        "audio_cache",
        "action_jobs",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE project_slug = ?", table))
            .bind(slug)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM projects WHERE slug = ?")
        .bind(slug)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Project {
    Project {
        slug: row.get("slug"),
        title: row.get("title"),
        domain: row.get("domain"),
        llm_model: row.get("llm_model"),
        system_prompt: row.get("system_prompt"),
        enabled: row.get("enabled"),
        emotions_enabled: row.get("emotions_enabled"),
        voice_enabled: row.get("voice_enabled"),
        sources_enabled: row.get("sources_enabled"),
        captions_enabled: row.get("captions_enabled"),
        debug_enabled: row.get("debug_enabled"),
        crm_webhook_url: row.get("crm_webhook_url"),
        mail_webhook_url: row.get("mail_webhook_url"),
        bot_token: row.get("bot_token"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
