//! HTTP server: public chat API, crawler control, admin knowledge CRUD,
//! voice sessions, and operational endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/chat` | Grounded answer as an SSE event stream |
//! | `POST` | `/api/v1/crawler/start` | Start a crawl job (409 when busy) |
//! | `POST` | `/api/v1/crawler/stop` | Cooperative stop |
//! | `GET`  | `/api/v1/crawler/status` | Job status and counters |
//! | `GET`  | `/api/v1/crawler/events` | Crawl progress as SSE |
//! | `*`    | `/api/v1/projects[/{slug}]` | Project CRUD |
//! | `*`    | `/api/v1/admin/knowledge…` | Documents and QA pairs |
//! | `POST` | `/api/v1/admin/knowledge/qa/upload` | CSV/XLSX bulk import |
//! | `GET`  | `/api/v1/admin/unanswered` | Curation queue |
//! | `GET`  | `/api/v1/admin/stats` | Daily request counters |
//! | `GET`  | `/api/v1/llm/servers` | Backend health readout |
//! | `*`    | `/api/v1/voice/…` | Voice sessions and WebSocket |
//! | `GET`  | `/health` `/healthz` `/metrics` | Operations |
//!
//! # Error contract
//!
//! Errors render as `{ "error": { "code", "message" } }` with the status
//! from the error taxonomy; rate limits add a `Retry-After` header.

mod admin;
mod chat;
mod voice;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::app::App;
use crate::error::Error;
use crate::gate::RequestClass;

pub(crate) type AppState = Arc<App>;

/// Start the HTTP server; runs until the process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = build_router(app.clone());

    tracing::info!(%bind_addr, "answer-harness listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Build the full router; exposed for integration tests and embedding.
pub fn build_router(app: Arc<App>) -> Router {
    let cors = if app.config.server.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = app
            .config
            .server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/api/v1/chat", post(chat::handle_chat))
        .route("/api/v1/crawler/start", post(admin::crawler_start))
        .route("/api/v1/crawler/stop", post(admin::crawler_stop))
        .route("/api/v1/crawler/status", get(admin::crawler_status))
        .route("/api/v1/crawler/events", get(admin::crawler_events))
        .route("/api/v1/projects", get(admin::list_projects).post(admin::create_project))
        .route(
            "/api/v1/projects/{slug}",
            get(admin::get_project)
                .put(admin::update_project)
                .delete(admin::delete_project),
        )
        .route("/api/v1/admin/knowledge", get(admin::knowledge_list).post(admin::knowledge_add))
        .route("/api/v1/admin/knowledge/{id}", delete(admin::knowledge_delete))
        .route("/api/v1/admin/knowledge/qa", post(admin::qa_add))
        .route("/api/v1/admin/knowledge/qa/{id}", delete(admin::qa_delete))
        .route("/api/v1/admin/knowledge/qa/upload", post(admin::qa_upload))
        .route("/api/v1/admin/unanswered", get(admin::unanswered))
        .route("/api/v1/admin/stats", get(admin::request_stats))
        .route("/api/v1/llm/servers", get(admin::llm_servers))
        .route("/api/v1/voice/session/start", post(voice::session_start))
        .route(
            "/api/v1/voice/session/{id}",
            get(voice::session_get).delete(voice::session_delete),
        )
        .route("/api/v1/voice/ws/{id}", get(voice::session_ws))
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(app.config.server.max_upload_bytes + 4096))
        .layer(cors)
        .with_state(app)
}

// ============ Error rendering ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

/// Wrapper rendering the error taxonomy as an HTTP response.
pub(crate) struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let field = match &self.0 {
            Error::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
                field,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Error::RateLimited { retry_after_secs } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

// ============ Request helpers ============

/// Best client address: first `X-Forwarded-For` hop, else the socket peer.
pub(crate) fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Authenticated user id, when the auth middleware in front set one.
pub(crate) fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|v| !v.is_empty())
}

/// Admit a request through the rate-limit gate.
pub(crate) async fn gate_check(
    app: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    class: RequestClass,
) -> Result<(), ApiError> {
    let ip = client_ip(headers, addr);
    let user = user_id(headers);
    app.gate
        .check(&ip, user.as_deref(), class)
        .await
        .map_err(|e| {
            crate::metrics::Metrics::incr(&app.metrics.rate_limited);
            ApiError(e)
        })
}

/// Double-submit token check for state-changing admin routes.
pub(crate) fn csrf_check(app: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(ref secret) = app.config.server.csrf_secret_key {
        let provided = headers.get("x-csrf-token").and_then(|v| v.to_str().ok());
        if provided != Some(secret.as_str()) {
            return Err(ApiError(Error::validation("csrf", "missing or invalid token")));
        }
    }
    Ok(())
}

// ============ Operational endpoints ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    store: String,
    vector_index: String,
    llm: String,
}

/// Dependency-aware health: the store, the vector index and the LLM
/// cluster each report, and the overall status degrades with them.
async fn handle_health(State(app): State<AppState>) -> Json<HealthResponse> {
    let store_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&app.pool)
        .await
        .is_ok();
    let vectors = crate::index::vector_count(&app.pool, None).await.ok();
    let llm_alive = app.cluster.any_backend_alive().await;

    let status = if store_ok { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        store: if store_ok { "up" } else { "down" }.to_string(),
        vector_index: match vectors {
            Some(n) => format!("up ({} vectors)", n),
            None => "down".to_string(),
        },
        llm: if llm_alive { "up" } else { "down" }.to_string(),
    })
}

/// Liveness only.
async fn handle_healthz() -> &'static str {
    "ok"
}

async fn handle_metrics(State(app): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        app.metrics.render(),
    )
        .into_response()
}
