//! Admin surface: project CRUD, knowledge management, crawler control,
//! curation queues and cluster readouts. State-changing routes pass the
//! rate-limit write gate and, when configured, the CSRF double-submit
//! check.

use axum::{
    extract::{ConnectInfo, Multipart, Path, Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use crate::crawler::CrawlRequest;
use crate::documents::{self, NewDocument};
use crate::error::Error;
use crate::gate::RequestClass;
use crate::indexer::DocumentChanged;
use crate::models::{CrawlJob, DocumentOrigin, Project, QaPair};
use crate::projects::{self, ProjectSpec};
use crate::qa;
use crate::stats;

use super::{csrf_check, gate_check, ApiError, AppState};

#[derive(Deserialize)]
pub(crate) struct ProjectQuery {
    project: String,
}

fn require_project_param(project: &str) -> Result<(), ApiError> {
    if project.trim().is_empty() {
        return Err(ApiError(Error::validation("project", "is required")));
    }
    Ok(())
}

// ============ Projects ============

pub(crate) async fn list_projects(
    State(app): State<AppState>,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(projects::list_projects(&app.pool).await?))
}

#[derive(Deserialize)]
pub(crate) struct CreateProjectRequest {
    slug: String,
    #[serde(flatten)]
    spec: ProjectSpec,
}

pub(crate) async fn create_project(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    Ok(Json(
        projects::create_project(&app.pool, &request.slug, request.spec).await?,
    ))
}

pub(crate) async fn get_project(
    State(app): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let project = projects::get_project(&app.pool, &slug)
        .await?
        .ok_or_else(|| Error::project_not_found(&slug))?;
    Ok(Json(project))
}

pub(crate) async fn update_project(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Json(spec): Json<ProjectSpec>,
) -> Result<Json<Project>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    Ok(Json(projects::update_project(&app.pool, &slug, spec).await?))
}

pub(crate) async fn delete_project(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    projects::delete_project(&app.pool, &slug).await?;
    app.retriever.invalidate_project(&slug).await;
    Ok(Json(serde_json::json!({})))
}

// ============ Knowledge ============

#[derive(Serialize)]
pub(crate) struct KnowledgeResponse {
    documents: Vec<documents::DocumentMeta>,
    qa_pairs: Vec<QaPair>,
}

pub(crate) async fn knowledge_list(
    State(app): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<KnowledgeResponse>, ApiError> {
    require_project_param(&query.project)?;
    let documents = documents::list_documents(&app.pool, &query.project).await?;
    let qa_pairs = qa::list_qa(&app.pool, &query.project).await?;
    Ok(Json(KnowledgeResponse {
        documents,
        qa_pairs,
    }))
}

#[derive(Deserialize)]
pub(crate) struct KnowledgeAddRequest {
    project: String,
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<f64>,
}

pub(crate) async fn knowledge_add(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<KnowledgeAddRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    require_project_param(&request.project)?;
    projects::get_project(&app.pool, &request.project)
        .await?
        .ok_or_else(|| Error::project_not_found(&request.project))?;

    let outcome = documents::upsert_document(
        &app.pool,
        &request.project,
        NewDocument {
            source_url: request.source_url,
            origin: DocumentOrigin::Upload,
            mime: "text/plain".into(),
            title: request.title,
            text: request.text,
            description: request.description,
            priority: request.priority.unwrap_or(0.0),
            blob: None,
        },
    )
    .await?;

    if outcome.changed() {
        let _ = app
            .doc_tx
            .send(DocumentChanged {
                project: request.project.clone(),
                document_id: outcome.document_id().to_string(),
            })
            .await;
    }
    Ok(Json(serde_json::json!({ "id": outcome.document_id() })))
}

pub(crate) async fn knowledge_delete(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;

    let doc = documents::get_document(&app.pool, &id)
        .await?
        .filter(|d| d.project_slug == query.project)
        .ok_or_else(|| Error::validation("id", "document not found in project"))?;
    documents::delete_document(&app.pool, &doc.id).await?;
    app.retriever.invalidate_project(&query.project).await;
    Ok(Json(serde_json::json!({})))
}

// ============ QA pairs ============

#[derive(Deserialize)]
pub(crate) struct QaAddRequest {
    project: String,
    question: String,
    answer: String,
    #[serde(default)]
    priority: Option<f64>,
}

pub(crate) async fn qa_add(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<QaAddRequest>,
) -> Result<Json<QaPair>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    require_project_param(&request.project)?;
    let pair = qa::add_qa(
        &app.pool,
        &request.project,
        &request.question,
        &request.answer,
        request.priority.unwrap_or(1.0),
    )
    .await?;
    Ok(Json(pair))
}

pub(crate) async fn qa_delete(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    qa::delete_qa(&app.pool, &query.project, &id).await?;
    Ok(Json(serde_json::json!({})))
}

/// Multipart CSV/XLSX import: fields `file` and `project`. The file is
/// MIME-validated, size-capped by the body limit, and processed under a
/// 30-second budget.
pub(crate) async fn qa_upload(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<qa::ImportReport>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;

    let mut project: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::validation("file", e.to_string())))?
    {
        match field.name() {
            Some("project") => {
                project = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError(Error::validation("project", e.to_string())))?,
                );
            }
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(String::from);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(Error::validation("file", e.to_string())))?;
                validate_upload_mime(&name, content_type.as_deref())?;
                file = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let project = project.ok_or_else(|| ApiError(Error::validation("project", "is required")))?;
    require_project_param(&project)?;
    projects::get_project(&app.pool, &project)
        .await?
        .ok_or_else(|| Error::project_not_found(&project))?;
    let (name, bytes) =
        file.ok_or_else(|| ApiError(Error::validation("file", "is required")))?;
    if bytes.len() > app.config.server.max_upload_bytes {
        return Err(ApiError(Error::validation(
            "file",
            format!("exceeds {} bytes", app.config.server.max_upload_bytes),
        )));
    }

    let import = async {
        if name.to_lowercase().ends_with(".xlsx") {
            qa::import_xlsx(&app.pool, &project, &bytes).await
        } else {
            qa::import_csv(&app.pool, &project, &bytes).await
        }
    };
    let report = tokio::time::timeout(Duration::from_secs(30), import)
        .await
        .map_err(|_| ApiError(Error::exhausted("import exceeded the 30s budget")))??;

    Ok(Json(report))
}

fn validate_upload_mime(name: &str, content_type: Option<&str>) -> Result<(), ApiError> {
    let name = name.to_lowercase();
    let by_name = name.ends_with(".csv") || name.ends_with(".xlsx");
    let by_type = matches!(
        content_type,
        Some("text/csv")
            | Some("application/csv")
            | Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
            | Some("application/octet-stream")
            | None
    );
    if by_name && by_type {
        Ok(())
    } else {
        Err(ApiError(Error::validation(
            "file",
            "expected a .csv or .xlsx upload",
        )))
    }
}

// ============ Crawler ============

#[derive(Deserialize)]
pub(crate) struct CrawlStartRequest {
    project: String,
    #[serde(flatten)]
    request: CrawlRequest,
}

pub(crate) async fn crawler_start(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CrawlStartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    require_project_param(&request.project)?;

    let project = projects::get_project(&app.pool, &request.project)
        .await?
        .ok_or_else(|| Error::project_not_found(&request.project))?;
    let job_id = app.crawler.start(&project, request.request).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

pub(crate) async fn crawler_stop(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(query): Json<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    csrf_check(&app, &headers)?;
    app.crawler.stop(&query.project).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Serialize)]
pub(crate) struct CrawlStatusResponse {
    status: String,
    counters: crate::models::CrawlCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_crawl_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

pub(crate) async fn crawler_status(
    State(app): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<CrawlStatusResponse>, ApiError> {
    require_project_param(&query.project)?;
    let job: Option<CrawlJob> = app.crawler.status(&query.project).await?;
    let response = match job {
        Some(job) => CrawlStatusResponse {
            status: job.status.as_str().to_string(),
            counters: job.counters,
            last_url: job.last_url,
            last_crawl_iso: chrono::DateTime::from_timestamp(job.started_at, 0)
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            last_error: job.last_error,
        },
        None => CrawlStatusResponse {
            status: "idle".to_string(),
            counters: Default::default(),
            last_url: None,
            last_crawl_iso: None,
            last_error: None,
        },
    };
    Ok(Json(response))
}

/// Crawl progress for the admin log stream, as SSE.
pub(crate) async fn crawler_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    use tokio_stream::StreamExt;

    let rx = app.crawler.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|event| {
        match event {
            Ok(event) => {
                let sse = SseEvent::default()
                    .event("crawl")
                    .json_data(&event)
                    .unwrap_or_else(|_| SseEvent::default().event("crawl").data("{}"));
                Some(Ok(sse))
            }
            // Lagged receivers skip missed events.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ Curation & stats ============

pub(crate) async fn unanswered(
    State(app): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Vec<stats::UnansweredQuestion>>, ApiError> {
    require_project_param(&query.project)?;
    Ok(Json(stats::list_unanswered(&app.pool, &query.project).await?))
}

pub(crate) async fn request_stats(
    State(app): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Vec<stats::DailyCount>>, ApiError> {
    require_project_param(&query.project)?;
    Ok(Json(stats::request_counts(&app.pool, &query.project, 30).await?))
}

// ============ LLM cluster ============

pub(crate) async fn llm_servers(
    State(app): State<AppState>,
) -> Json<Vec<crate::llm::BackendStatus>> {
    Json(app.cluster.statuses().await)
}
