//! Action dispatcher: model-requested side effects, executed at most once.
//!
//! Enqueues are persistent (`action_jobs` table) and deduplicated on
//! (request_id, kind), so a replayed request coalesces instead of firing
//! twice. A single worker drains due jobs, POSTing to the project's CRM
//! webhook or mail connector. Transient failures retry with capped
//! exponential backoff; exhausting the attempts records a terminal
//! failure that is never retried automatically. Integration endpoints
//! are untrusted: URLs pass the same SSRF rules as crawler fetches.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

use crate::config::ActionsConfig;
use crate::crawler::safety::{self, UrlPolicy};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::models::ActionKind;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    /// An identical (request_id, kind) job already exists; coalesced.
    Coalesced,
}

/// Job row surfaced to the orchestrator's `actions` event.
#[derive(Debug, Clone, Serialize)]
pub struct ActionJobStatus {
    pub kind: ActionKind,
    pub status: String,
}

pub struct ActionDispatcher {
    pool: SqlitePool,
    config: ActionsConfig,
    client: reqwest::Client,
    wakeup: Notify,
    metrics: Arc<Metrics>,
    /// Relaxed SSRF policy for test deployments.
    allow_private_endpoints: bool,
}

impl ActionDispatcher {
    pub fn new(
        pool: SqlitePool,
        config: ActionsConfig,
        metrics: Arc<Metrics>,
        allow_private_endpoints: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Arc::new(Self {
            pool,
            config,
            client,
            wakeup: Notify::new(),
            metrics,
            allow_private_endpoints,
        }))
    }

    /// Persist a job; duplicates coalesce. Never drops.
    pub async fn enqueue(
        &self,
        project: &str,
        request_id: &str,
        kind: ActionKind,
        payload: serde_json::Value,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO action_jobs (id, request_id, kind, project_slug, payload_json,
                status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
            ON CONFLICT(request_id, kind) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(request_id)
        .bind(kind.as_str())
        .bind(project)
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.wakeup.notify_one();
        if result.rows_affected() == 0 {
            Ok(EnqueueOutcome::Coalesced)
        } else {
            Ok(EnqueueOutcome::Queued)
        }
    }

    /// Job statuses for one request, for the terminal `actions` event.
    pub async fn statuses_for_request(&self, request_id: &str) -> Result<Vec<ActionJobStatus>> {
        let rows = sqlx::query("SELECT kind, status FROM action_jobs WHERE request_id = ?")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let kind: String = r.get("kind");
                ActionKind::parse(&kind).map(|kind| ActionJobStatus {
                    kind,
                    status: r.get("status"),
                })
            })
            .collect())
    }

    /// Run the dispatch worker until the process exits.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.process_due().await {
                    Ok(0) => {
                        // Idle: wait for an enqueue or recheck for due
                        // retries once a second.
                        tokio::select! {
                            _ = self.wakeup.notified() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "action worker pass failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    /// Execute every due job once; returns how many were attempted.
    pub async fn process_due(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let rows = sqlx::query(
            "SELECT id FROM action_jobs WHERE status = 'queued' AND next_attempt_at <= ?
             ORDER BY created_at ASC LIMIT 16",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut attempted = 0u64;
        for row in rows {
            let id: String = row.get("id");
            // Claim guards against a second worker picking the same job.
            let claimed = sqlx::query(
                "UPDATE action_jobs SET status = 'running', updated_at = ?
                 WHERE id = ? AND status = 'queued'",
            )
            .bind(now)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }
            attempted += 1;
            self.execute_job(&id).await;
        }
        Ok(attempted)
    }

    async fn execute_job(&self, job_id: &str) {
        let outcome = self.try_execute(job_id).await;
        let now = Utc::now().timestamp();

        match outcome {
            Ok(()) => {
                let _ = sqlx::query(
                    "UPDATE action_jobs SET status = 'succeeded', updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(job_id)
                .execute(&self.pool)
                .await;
                Metrics::incr(&self.metrics.actions_executed);
            }
            Err(e) => {
                let attempts: i64 = sqlx::query_scalar(
                    "UPDATE action_jobs SET attempts = attempts + 1, last_error = ?,
                     updated_at = ? WHERE id = ? RETURNING attempts",
                )
                .bind(e.to_string())
                .bind(now)
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .unwrap_or(i64::MAX);

                let permanent =
                    !e.is_transient() || attempts >= self.config.max_attempts as i64;
                if permanent {
                    tracing::error!(job = %job_id, error = %e, "action failed terminally");
                    let _ = sqlx::query(
                        "UPDATE action_jobs SET status = 'failed' WHERE id = ?",
                    )
                    .bind(job_id)
                    .execute(&self.pool)
                    .await;
                } else {
                    // Exponential backoff, capped at ~10 minutes.
                    let delay = (self.config.initial_backoff_secs
                        << (attempts - 1).min(8) as u64)
                        .min(600);
                    tracing::warn!(job = %job_id, attempts, delay, error = %e, "action retry scheduled");
                    let _ = sqlx::query(
                        "UPDATE action_jobs SET status = 'queued', next_attempt_at = ? WHERE id = ?",
                    )
                    .bind(now + delay as i64)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await;
                }
            }
        }
    }

    async fn try_execute(&self, job_id: &str) -> Result<()> {
        let row = sqlx::query(
            "SELECT request_id, kind, project_slug, payload_json FROM action_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        let kind: String = row.get("kind");
        let kind = ActionKind::parse(&kind)
            .ok_or_else(|| Error::validation("kind", "unknown action kind"))?;
        let project: String = row.get("project_slug");
        let request_id: String = row.get("request_id");
        let payload: serde_json::Value =
            serde_json::from_str(row.get::<String, _>("payload_json").as_str())
                .unwrap_or(serde_json::Value::Null);

        let endpoint_col = match kind {
            ActionKind::CrmTicket => "crm_webhook_url",
            ActionKind::Email => "mail_webhook_url",
        };
        let endpoint: Option<String> = sqlx::query_scalar(&format!(
            "SELECT {} FROM projects WHERE slug = ?",
            endpoint_col
        ))
        .bind(&project)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        let Some(endpoint) = endpoint else {
            return Err(Error::misconfigured(format!(
                "project '{}' has no endpoint for {}",
                project,
                kind.as_str()
            )));
        };

        let url = Url::parse(&endpoint)
            .map_err(|e| Error::validation("endpoint", format!("invalid URL: {}", e)))?;
        let mut policy = UrlPolicy::default();
        policy.allow_private = self.allow_private_endpoints;
        safety::check_url(&url, &policy).await?;

        let body = serde_json::json!({
            "request_id": request_id,
            "project": project,
            "kind": kind.as_str(),
            "payload": payload,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("webhook unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(Error::upstream(format!("webhook returned {}", status)))
        } else {
            Err(Error::validation(
                "endpoint",
                format!("webhook rejected the action: {}", status),
            ))
        }
    }
}

/// Parse the model-emitted action envelope from the head of a response.
/// The envelope is a single-line JSON object on the first non-empty line:
/// `{"action": {"kind": "crm_ticket", ...}}`. Returns the action payload
/// and the user-visible remainder of the text.
pub fn parse_action_envelope(text: &str) -> (Option<(ActionKind, serde_json::Value)>, String) {
    let trimmed = text.trim_start();
    let first_line_end = trimmed.find('\n').unwrap_or(trimmed.len());
    let first_line = trimmed[..first_line_end].trim();

    if !first_line.starts_with('{') {
        return (None, text.to_string());
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(first_line) else {
        return (None, text.to_string());
    };
    let Some(action) = value.get("action") else {
        return (None, text.to_string());
    };
    let kind = action
        .get("kind")
        .and_then(|k| k.as_str())
        .and_then(ActionKind::parse);
    let Some(kind) = kind else {
        return (None, text.to_string());
    };

    let rest = trimmed[first_line_end..].trim_start().to_string();
    (Some((kind, action.clone())), rest)
}
