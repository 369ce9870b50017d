//! HTTP client for a single OpenAI-compatible inference backend.
//!
//! Speaks `POST /v1/chat/completions` with `stream: true` and decodes the
//! SSE response into a token stream; `GET /v1/models` doubles as the
//! health/model-discovery probe. Errors are classified so the cluster can
//! decide between failover (transient), model unlisting (model not found)
//! and giving up (fatal).

use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// One message in the chat transcript sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Sampling options; part of the completion cache key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplingOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Failure classification for routing decisions.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection refused, timeout, 5xx, 408/429: another backend may serve.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// The backend does not serve the requested model.
    #[error("model not found on backend")]
    ModelNotFound,
    /// Anything else; retrying elsewhere will not help.
    #[error("backend request failed: {0}")]
    Fatal(String),
}

/// Stream of text tokens from one backend request.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Open a streaming completion against `base_url`.
pub async fn open_stream(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
    messages: &[ChatMessage],
    options: &SamplingOptions,
) -> Result<TokenStream, BackendError> {
    let request = CompletionRequest {
        model,
        messages,
        stream: true,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    };
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));

    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| BackendError::Transient(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), &body));
    }

    let stream = response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) => {
                    if event.data.trim() == "[DONE]" {
                        return None;
                    }
                    match serde_json::from_str::<StreamChunk>(&event.data) {
                        Ok(chunk) => chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                            .filter(|t| !t.is_empty())
                            .map(Ok),
                        // Keep-alives and unknown frames are skipped.
                        Err(_) => None,
                    }
                }
                Err(e) => Some(Err(BackendError::Transient(format!(
                    "stream decode error: {}",
                    e
                )))),
            }
        });

    Ok(Box::pin(stream))
}

fn classify_status(status: u16, body: &str) -> BackendError {
    match status {
        404 => BackendError::ModelNotFound,
        408 | 429 => BackendError::Transient(format!("backend {}: {}", status, body)),
        s if s >= 500 => BackendError::Transient(format!("backend {}: {}", status, body)),
        s => {
            // Some servers report unknown models as 400 with a hint.
            if body.contains("model") && (body.contains("not found") || body.contains("unknown")) {
                BackendError::ModelNotFound
            } else {
                BackendError::Fatal(format!("backend {}: {}", s, body))
            }
        }
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Probe the backend's model list; liveness check and routing input.
pub async fn probe_models(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
) -> Result<Vec<String>, BackendError> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| BackendError::Transient(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::Transient(format!("probe {}", status)));
    }

    let models: ModelsResponse = response
        .json()
        .await
        .map_err(|e| BackendError::Transient(format!("probe decode: {}", e)))?;
    Ok(models.data.into_iter().map(|m| m.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse_body(tokens: &[&str]) -> String {
        let mut body = String::new();
        for token in tokens {
            let chunk = serde_json::json!({
                "choices": [{ "delta": { "content": token } }]
            });
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn test_stream_decodes_tokens_in_order() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["Hel", "lo", " world"]));
        });

        let client = reqwest::Client::new();
        let messages = vec![ChatMessage::user("hi")];
        let stream = open_stream(
            &client,
            &server.base_url(),
            "m",
            &messages,
            &SamplingOptions::default(),
        )
        .await
        .unwrap();

        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["Hel", "lo", " world"]);
    }

    #[tokio::test]
    async fn test_503_classified_transient() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(503).body("overloaded");
        });

        let client = reqwest::Client::new();
        let err = open_stream(
            &client,
            &server.base_url(),
            "m",
            &[ChatMessage::user("hi")],
            &SamplingOptions::default(),
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
    }

    #[tokio::test]
    async fn test_404_classified_model_not_found() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(404).body("no such model");
        });

        let client = reqwest::Client::new();
        let err = open_stream(
            &client,
            &server.base_url(),
            "m",
            &[ChatMessage::user("hi")],
            &SamplingOptions::default(),
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, BackendError::ModelNotFound));
    }

    #[tokio::test]
    async fn test_probe_models_parses_ids() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/v1/models");
            then.status(200).json_body(serde_json::json!({
                "data": [{ "id": "llama3" }, { "id": "mistral" }]
            }));
        });

        let client = reqwest::Client::new();
        let models = probe_models(&client, &server.base_url(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(models, vec!["llama3", "mistral"]);
    }
}
