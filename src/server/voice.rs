//! Voice session HTTP endpoints and the bidirectional WebSocket.
//!
//! Upstream frames (JSON text, audio also accepted as raw binary):
//! `{"type":"audio","data":"<base64>"}`, `{"type":"end_utterance"}`,
//! `{"type":"ping"}`, `{"type":"close"}`. Downstream frames mirror the
//! utterance pipeline: `transcript`, `token`, `audio` (base64),
//! `actions`, `done`, `error`, plus `pong`. A socket silent past the
//! ping window is closed and its session released.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::gate::RequestClass;
use crate::voice::{SessionInfo, VoiceEvent};

use super::{gate_check, ApiError, AppState};

/// Socket silence window before the session is considered gone.
const PING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub(crate) struct SessionStartRequest {
    project: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    voice: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
}

fn default_language() -> String {
    "en-US".to_string()
}

pub(crate) async fn session_start(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SessionStartRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    if request.project.trim().is_empty() {
        return Err(ApiError(Error::validation("project", "is required")));
    }
    let info = app
        .voice
        .start_session(
            &request.project,
            &request.language,
            request.voice,
            request.emotion,
        )
        .await?;
    Ok(Json(info))
}

pub(crate) async fn session_get(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(app.voice.session_info(&id).await?))
}

pub(crate) async fn session_delete(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate_check(&app, &headers, &addr, RequestClass::Write).await?;
    app.voice.close_session(&id).await?;
    Ok(Json(serde_json::json!({})))
}

pub(crate) async fn session_ws(
    State(app): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    // Reject unknown sessions before upgrading.
    if app.voice.session_info(&id).await.is_err() {
        return ApiError(Error::validation("session", "not found")).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(app, id, socket))
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<String>,
}

async fn handle_socket(app: AppState, session_id: String, mut socket: WebSocket) {
    loop {
        let message = match tokio::time::timeout(PING_TIMEOUT, socket.recv()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                tracing::info!(session = %session_id, "voice socket ping timeout");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) else {
                    send_error(&mut socket, "validation_error", "malformed frame").await;
                    continue;
                };
                match frame.kind.as_str() {
                    "audio" => {
                        let Some(data) = frame.data else {
                            send_error(&mut socket, "validation_error", "audio frame without data")
                                .await;
                            continue;
                        };
                        let Ok(bytes) =
                            base64::engine::general_purpose::STANDARD.decode(data.as_bytes())
                        else {
                            send_error(&mut socket, "validation_error", "invalid base64 audio")
                                .await;
                            continue;
                        };
                        push_audio(&app, &session_id, &mut socket, &bytes).await;
                    }
                    "end_utterance" => {
                        if !run_utterance(&app, &session_id, &mut socket).await {
                            break;
                        }
                    }
                    "ping" => {
                        app.voice.touch(&session_id).await;
                        let _ = socket
                            .send(Message::Text(r#"{"type":"pong"}"#.to_string().into()))
                            .await;
                    }
                    "close" => break,
                    other => {
                        send_error(
                            &mut socket,
                            "validation_error",
                            &format!("unknown frame type: {}", other),
                        )
                        .await;
                    }
                }
            }
            Message::Binary(bytes) => {
                push_audio(&app, &session_id, &mut socket, &bytes).await;
            }
            Message::Ping(_) | Message::Pong(_) => {
                app.voice.touch(&session_id).await;
            }
            Message::Close(_) => break,
        }
    }

    // The socket is the session's lifeline; release everything on close.
    let _ = app.voice.close_session(&session_id).await;
}

async fn push_audio(app: &AppState, session_id: &str, socket: &mut WebSocket, bytes: &[u8]) {
    if let Err(e) = app.voice.push_audio(session_id, bytes).await {
        send_error(socket, e.code(), &e.to_string()).await;
    }
}

/// Drain one utterance pipeline into the socket. Pings are still served
/// while the pipeline runs; new audio is rejected by the session phase.
/// Returns false when the socket died.
async fn run_utterance(app: &AppState, session_id: &str, socket: &mut WebSocket) -> bool {
    let mut rx = match app.voice.run_utterance(session_id).await {
        Ok(rx) => rx,
        Err(e) => {
            send_error(socket, e.code(), &e.to_string()).await;
            return true;
        }
    };

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { return true };
                let frame = outbound_frame(&event);
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    return false;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                            match frame.kind.as_str() {
                                "ping" => {
                                    app.voice.touch(session_id).await;
                                    let _ = socket
                                        .send(Message::Text(r#"{"type":"pong"}"#.to_string().into()))
                                        .await;
                                }
                                "close" => return false,
                                _ => {
                                    send_error(
                                        socket,
                                        "conflict",
                                        "utterance in progress",
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {
                        send_error(socket, "conflict", "utterance in progress").await;
                    }
                    Some(Err(_)) => return false,
                }
            }
        }
    }
}

fn outbound_frame(event: &VoiceEvent) -> String {
    let value = match event {
        VoiceEvent::Transcript(text) => {
            serde_json::json!({ "type": "transcript", "text": text })
        }
        VoiceEvent::Token(text) => serde_json::json!({ "type": "token", "text": text }),
        VoiceEvent::Audio(bytes) => serde_json::json!({
            "type": "audio",
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
        VoiceEvent::Actions(actions) => {
            serde_json::json!({ "type": "actions", "actions": actions })
        }
        VoiceEvent::Done => serde_json::json!({ "type": "done" }),
        VoiceEvent::Error { kind, message } => {
            serde_json::json!({ "type": "error", "kind": kind, "message": message })
        }
    };
    value.to_string()
}

async fn send_error(socket: &mut WebSocket, kind: &str, message: &str) {
    let frame = serde_json::json!({ "type": "error", "kind": kind, "message": message });
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
}
