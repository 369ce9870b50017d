//! `POST /api/v1/chat`: grounded answers as a one-way SSE stream.
//!
//! Events: `token`, `sources`, `actions`, `done`, `error`. Closing the
//! connection drops the stream, which cancels retrieval and the upstream
//! LLM request.

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::error::Error;
use crate::gate::RequestClass;
use crate::models::Turn;
use crate::orchestrator::AnswerOptions;

use super::{gate_check, ApiError, AppState};

#[derive(Deserialize)]
pub(crate) struct ChatRequest {
    #[serde(default)]
    project: String,
    #[serde(default)]
    message: String,
    /// Client-chosen session identifier, echoed into logs.
    #[serde(default)]
    session_id: Option<String>,
    /// Prior turns of this conversation, most recent last.
    #[serde(default)]
    history: Vec<HistoryTurn>,
}

#[derive(Deserialize)]
pub(crate) struct HistoryTurn {
    role: String,
    text: String,
}

pub(crate) async fn handle_chat(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;

    if request.project.trim().is_empty() {
        return Err(ApiError(Error::validation("project", "is required")));
    }
    if request.message.trim().is_empty() {
        return Err(ApiError(Error::validation("message", "is required")));
    }

    if let Some(ref session_id) = request.session_id {
        tracing::debug!(project = %request.project, session = %session_id, "chat request");
    }

    let history: Vec<Turn> = request
        .history
        .iter()
        .map(|t| Turn {
            role: t.role.clone(),
            text: t.text.clone(),
            at: 0,
        })
        .collect();

    let handle = app
        .orchestrator
        .answer(
            &request.project,
            &request.message,
            AnswerOptions {
                no_llm_cache: false,
                history,
            },
        )
        .await?;

    let stream = ReceiverStream::new(handle.events).map(|event| {
        let (name, data) = event.sse_parts();
        let sse = SseEvent::default()
            .event(name)
            .json_data(&data)
            .unwrap_or_else(|_| SseEvent::default().event("error").data("{}"));
        Ok::<_, Infallible>(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
