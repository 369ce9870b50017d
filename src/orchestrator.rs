//! Answer orchestrator: the end-to-end chat request path.
//!
//! retrieve → prompt → stream → post-process. Tokens relay in upstream
//! order; the terminal `sources`, `actions` and `done` events arrive
//! strictly after the last token. Closing the downstream receiver cancels
//! the pipeline, which drops the upstream LLM stream and aborts the
//! backend request.
//!
//! The model may request a side effect by emitting a single-line JSON
//! envelope before its user-facing text; the orchestrator withholds that
//! line from the client, enqueues the action after the stream completes,
//! and reports job statuses in the terminal `actions` event. Answers
//! equal to the configured no-answer sentinel are recorded as unanswered
//! questions for curation.

use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::actions::{parse_action_envelope, ActionDispatcher, ActionJobStatus};
use crate::config::PromptConfig;
use crate::error::{Error, Result};
use crate::llm::{GenerateRequest, LlmCluster, SamplingOptions};
use crate::metrics::Metrics;
use crate::models::{Project, SearchHit, Turn};
use crate::prompt::{build_prompt, BuiltPrompt};
use crate::projects;
use crate::retriever::Retriever;
use crate::stats;

/// Citation reference in the terminal `sources` event.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    /// Citation number as used in the answer text (`[1]` → 1).
    pub id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Streamed answer events, transported over SSE or the voice WebSocket.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    Token { text: String, index: u64 },
    Sources(Vec<SourceRef>),
    Actions(Vec<ActionJobStatus>),
    Done,
    Error { kind: String, message: String },
}

impl AnswerEvent {
    /// (event name, JSON payload) for the SSE transport.
    pub fn sse_parts(&self) -> (&'static str, serde_json::Value) {
        match self {
            AnswerEvent::Token { text, index } => {
                ("token", serde_json::json!({ "text": text, "index": index }))
            }
            AnswerEvent::Sources(sources) => {
                ("sources", serde_json::json!(sources))
            }
            AnswerEvent::Actions(actions) => ("actions", serde_json::json!(actions)),
            AnswerEvent::Done => ("done", serde_json::json!({})),
            AnswerEvent::Error { kind, message } => (
                "error",
                serde_json::json!({ "kind": kind, "message": message }),
            ),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    /// Bypass the LLM completion cache (voice sessions).
    pub no_llm_cache: bool,
    /// Conversation history, most recent last.
    pub history: Vec<Turn>,
}

/// Outcome summary returned to embedding callers (voice) that consume
/// the event stream themselves.
#[derive(Debug)]
pub struct AnswerHandle {
    pub request_id: String,
    pub events: mpsc::Receiver<AnswerEvent>,
}

pub struct Orchestrator {
    pool: SqlitePool,
    retriever: Arc<Retriever>,
    cluster: Arc<LlmCluster>,
    dispatcher: Arc<ActionDispatcher>,
    prompt_config: PromptConfig,
    top_k: i64,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        retriever: Arc<Retriever>,
        cluster: Arc<LlmCluster>,
        dispatcher: Arc<ActionDispatcher>,
        prompt_config: PromptConfig,
        top_k: i64,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            retriever,
            cluster,
            dispatcher,
            prompt_config,
            top_k,
            metrics,
        })
    }

    /// Serve one chat request as a stream of events. Project resolution
    /// failures surface as errors before any stream exists; later
    /// failures arrive as terminal `error` events.
    pub async fn answer(
        self: &Arc<Self>,
        project_slug: &str,
        user_message: &str,
        options: AnswerOptions,
    ) -> Result<AnswerHandle> {
        let user_message = user_message.trim().to_string();
        if user_message.is_empty() {
            return Err(Error::validation("message", "must not be empty"));
        }

        let project = projects::require_serving_project(&self.pool, project_slug).await?;
        Metrics::incr(&self.metrics.chat_requests);

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(64);

        let orchestrator = Arc::clone(self);
        let task_request_id = request_id.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator
                .run_pipeline(&project, &user_message, options, &task_request_id, &tx)
                .await
            {
                Metrics::incr(&orchestrator.metrics.chat_errors);
                let _ = tx
                    .send(AnswerEvent::Error {
                        kind: e.code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        Ok(AnswerHandle {
            request_id,
            events: rx,
        })
    }

    async fn run_pipeline(
        &self,
        project: &Project,
        user_message: &str,
        options: AnswerOptions,
        request_id: &str,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<()> {
        let retrieval = self
            .retriever
            .hybrid_search(&project.slug, user_message, self.top_k)
            .await?;
        if retrieval.degraded {
            tracing::info!(project = %project.slug, "serving degraded retrieval");
        }

        // A curated QA match answers deterministically, without the model.
        if let Some(qa_hit) = retrieval.hits.first().filter(|h| h.chunk_id.starts_with("qa:")) {
            let answer = qa_hit.excerpt.clone();
            let _ = tx
                .send(AnswerEvent::Token {
                    text: answer,
                    index: 0,
                })
                .await;
            let _ = tx
                .send(AnswerEvent::Sources(vec![SourceRef {
                    id: 1,
                    url: None,
                    title: qa_hit.title.clone(),
                }]))
                .await;
            let _ = tx.send(AnswerEvent::Done).await;
            stats::increment_request_count(&self.pool, &project.slug).await?;
            return Ok(());
        }

        let built = build_prompt(
            project,
            &options.history,
            &retrieval.hits,
            user_message,
            &self.prompt_config,
        );

        let model = project
            .llm_model
            .clone()
            .unwrap_or_else(|| self.cluster.default_model().to_string());
        let stream = self
            .cluster
            .generate(GenerateRequest {
                model,
                messages: built.messages.clone(),
                options: SamplingOptions::default(),
                no_cache: options.no_llm_cache,
            })
            .await?;

        let full_text = self.relay_tokens(stream, project, tx).await?;

        self.finish(project, user_message, &built, &full_text, request_id, tx)
            .await
    }

    /// Relay tokens to the client, withholding a possible action envelope
    /// line, and return the full accumulated response.
    async fn relay_tokens(
        &self,
        mut stream: crate::llm::TokenStream,
        project: &Project,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<String> {
        use futures::StreamExt;

        let intercept =
            project.crm_webhook_url.is_some() || project.mail_webhook_url.is_some();
        let mut gate = EnvelopeGate::new(intercept);
        let mut accumulated = String::new();
        let mut index: u64 = 0;

        while let Some(item) = stream.next().await {
            let token = item?;
            accumulated.push_str(&token);
            if let Some(emit) = gate.push(&token) {
                if !emit.is_empty() {
                    if tx
                        .send(AnswerEvent::Token { text: emit, index })
                        .await
                        .is_err()
                    {
                        // Client gone: dropping the stream aborts upstream.
                        return Err(Error::upstream("client disconnected"));
                    }
                    index += 1;
                }
            }
        }

        if let Some(rest) = gate.finish() {
            if !rest.is_empty() {
                let _ = tx.send(AnswerEvent::Token { text: rest, index }).await;
            }
        }

        Ok(accumulated)
    }

    async fn finish(
        &self,
        project: &Project,
        user_message: &str,
        built: &BuiltPrompt,
        full_text: &str,
        request_id: &str,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<()> {
        let (action, user_text) = parse_action_envelope(full_text);

        // Sources actually referenced by the answer; all of them when the
        // model cited nothing explicitly.
        let is_no_answer = user_text
            .trim()
            .starts_with(self.prompt_config.no_answer_sentinel.as_str());
        let sources = if project.sources_enabled && !is_no_answer {
            referenced_sources(&user_text, &built.sources)
        } else {
            Vec::new()
        };
        if !sources.is_empty() {
            let _ = tx.send(AnswerEvent::Sources(sources)).await;
        }

        // Side effects, at most once per (request, kind).
        if let Some((kind, payload)) = action {
            match self
                .dispatcher
                .enqueue(&project.slug, request_id, kind, payload)
                .await
            {
                Ok(_) => {
                    let statuses = self
                        .dispatcher
                        .statuses_for_request(request_id)
                        .await
                        .unwrap_or_default();
                    let _ = tx.send(AnswerEvent::Actions(statuses)).await;
                }
                Err(e) => {
                    tracing::warn!(project = %project.slug, error = %e, "action enqueue failed");
                }
            }
        }

        if is_no_answer {
            stats::record_unanswered(&self.pool, &project.slug, user_message).await?;
        }
        stats::increment_request_count(&self.pool, &project.slug).await?;

        let _ = tx.send(AnswerEvent::Done).await;
        Ok(())
    }
}

/// Map `[n]` citations in the answer to the prompt's source list. An
/// answer with no explicit citations attributes every provided source.
fn referenced_sources(text: &str, prompt_sources: &[SearchHit]) -> Vec<SourceRef> {
    let mut cited: Vec<usize> = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(close) = text[i + 1..].find(']') {
                let inner = &text[i + 1..i + 1 + close];
                if let Ok(n) = inner.parse::<usize>() {
                    if n >= 1 && n <= prompt_sources.len() && !cited.contains(&n) {
                        cited.push(n);
                    }
                }
                i += close + 2;
                continue;
            }
        }
        i += 1;
    }

    if cited.is_empty() {
        cited = (1..=prompt_sources.len()).collect();
    }
    cited.sort_unstable();

    cited
        .into_iter()
        .map(|n| {
            let hit = &prompt_sources[n - 1];
            SourceRef {
                id: n,
                url: hit.source_url.clone(),
                title: hit.title.clone(),
            }
        })
        .collect()
}

/// Withholds a potential action-envelope first line from the client
/// while letting ordinary text stream through untouched.
struct EnvelopeGate {
    enabled: bool,
    buffer: String,
    resolved: bool,
}

impl EnvelopeGate {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            buffer: String::new(),
            resolved: !enabled,
        }
    }

    /// Feed a token; returns text safe to emit now.
    fn push(&mut self, token: &str) -> Option<String> {
        if self.resolved {
            return Some(token.to_string());
        }
        self.buffer.push_str(token);

        let head = self.buffer.trim_start();
        if head.is_empty() {
            return None;
        }
        if !head.starts_with('{') {
            // Not an envelope; release everything buffered.
            self.resolved = true;
            return Some(std::mem::take(&mut self.buffer));
        }
        if let Some(newline) = head.find('\n') {
            // First line complete: strip it if it is an action envelope.
            let (action, rest) = parse_action_envelope(head);
            let result = if action.is_some() {
                rest
            } else {
                head[..newline].to_string() + &head[newline..]
            };
            self.resolved = true;
            self.buffer.clear();
            return Some(result);
        }
        None
    }

    /// End of stream: release whatever is held, minus a complete
    /// envelope-only response.
    fn finish(&mut self) -> Option<String> {
        if self.resolved || self.buffer.is_empty() {
            return None;
        }
        let head = self.buffer.trim_start().to_string();
        let (action, rest) = parse_action_envelope(&head);
        self.buffer.clear();
        Some(if action.is_some() { rest } else { head })
    }
}
