//! LLM dispatch layer: a cluster of OpenAI-compatible inference backends
//! behind a single `generate(model, messages, options) → stream<token>`.
//!
//! Routing picks among healthy backends that advertise the requested
//! model: fewest in-flight requests first, EWMA latency as the tiebreak.
//! Transient failures before the first token fail over to the next
//! eligible backend (bounded by `llm.max_retries`); `ModelNotFound`
//! unlists the model on that backend and tries the others. A per-backend
//! semaphore caps concurrency; when no backend yields a permit within the
//! admission wait the request is rejected with `BackendUnavailable`.
//!
//! Exact repeats are served from the completion cache (TTL
//! `cache.ttl_llm_secs`) unless the caller opts out, as voice does.

pub mod client;
pub mod health;

use futures::stream::Stream;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

pub use client::{ChatMessage, SamplingOptions};

use client::BackendError;

/// Backend health as seen by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Up,
    Down,
    Unknown,
}

#[derive(Debug)]
pub(crate) struct BackendState {
    pub health: Health,
    pub models: HashSet<String>,
    pub ewma_latency_ms: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// One inference backend and its runtime state.
pub struct Backend {
    pub id: String,
    pub base_url: String,
    pub enabled: bool,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) state: RwLock<BackendState>,
}

impl Backend {
    fn new(id: String, base_url: String, enabled: bool, concurrency: usize) -> Self {
        Self {
            id,
            base_url,
            enabled,
            in_flight: AtomicUsize::new(0),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            state: RwLock::new(BackendState {
                health: Health::Unknown,
                models: HashSet::new(),
                ewma_latency_ms: 0.0,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
        }
    }
}

/// Status row for the admin/health surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub base_url: String,
    pub enabled: bool,
    pub health: Health,
    pub models: Vec<String>,
    pub in_flight: usize,
    pub ewma_latency_ms: f64,
}

/// A request for the cluster.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: SamplingOptions,
    /// Bypass the completion cache (voice, debug).
    pub no_cache: bool,
}

/// Stream of tokens handed to the orchestrator.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

pub struct LlmCluster {
    backends: Vec<Arc<Backend>>,
    config: LlmConfig,
    http: reqwest::Client,
    cache: Cache,
    cache_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl LlmCluster {
    /// Build the cluster from configured seed servers plus the persisted
    /// `llm_servers` table.
    pub async fn load(
        pool: &SqlitePool,
        config: LlmConfig,
        cache: Cache,
        cache_ttl_secs: u64,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        // Seed config servers into the table so the admin surface sees one
        // consistent list.
        for base_url in &config.servers {
            sqlx::query(
                "INSERT INTO llm_servers (id, base_url, enabled) VALUES (?, ?, 1)
                 ON CONFLICT(base_url) DO NOTHING",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(base_url.trim_end_matches('/'))
            .execute(pool)
            .await?;
        }

        let rows = sqlx::query("SELECT id, base_url, enabled FROM llm_servers ORDER BY base_url")
            .fetch_all(pool)
            .await?;
        let backends = rows
            .iter()
            .map(|r| {
                Arc::new(Backend::new(
                    r.get("id"),
                    r.get("base_url"),
                    r.get("enabled"),
                    config.per_backend_concurrency,
                ))
            })
            .collect();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            backends,
            config,
            http,
            cache,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            metrics,
        })
    }

    /// In-memory cluster for tests and embedded use.
    pub fn from_urls(
        urls: &[String],
        config: LlmConfig,
        cache: Cache,
        cache_ttl_secs: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let backends = urls
            .iter()
            .enumerate()
            .map(|(i, u)| {
                Arc::new(Backend::new(
                    format!("b{}", i),
                    u.trim_end_matches('/').to_string(),
                    true,
                    config.per_backend_concurrency,
                ))
            })
            .collect();
        Self {
            backends,
            config,
            http: reqwest::Client::new(),
            cache,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            metrics,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    pub(crate) fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub(crate) fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn statuses(&self) -> Vec<BackendStatus> {
        let mut out = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let state = backend.state.read().await;
            let mut models: Vec<String> = state.models.iter().cloned().collect();
            models.sort();
            out.push(BackendStatus {
                id: backend.id.clone(),
                base_url: backend.base_url.clone(),
                enabled: backend.enabled,
                health: state.health,
                models,
                in_flight: backend.in_flight.load(Ordering::Relaxed),
                ewma_latency_ms: state.ewma_latency_ms,
            });
        }
        out
    }

    /// True when at least one enabled backend is not down.
    pub async fn any_backend_alive(&self) -> bool {
        for backend in &self.backends {
            if !backend.enabled {
                continue;
            }
            if backend.state.read().await.health != Health::Down {
                return true;
            }
        }
        false
    }

    /// Stream a completion, failing over across backends on transient
    /// errors that occur before the first token.
    pub async fn generate(&self, request: GenerateRequest) -> Result<TokenStream> {
        Metrics::incr(&self.metrics.llm_requests);

        let cache_key = completion_cache_key(&request);
        if !request.no_cache {
            if let Some(bytes) = self.cache.get(&cache_key).await {
                Metrics::incr(&self.metrics.cache_hits);
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let single = futures::stream::once(async move { Ok(text) });
                return Ok(Box::pin(single));
            }
            Metrics::incr(&self.metrics.cache_misses);
        }

        let mut attempts = 0u32;
        let mut last_error: Option<Error> = None;
        let mut tried: HashSet<String> = HashSet::new();

        while attempts <= self.config.max_retries {
            let Some(backend) = self.pick_backend(&request.model, &tried).await else {
                break;
            };
            tried.insert(backend.id.clone());

            let permit = match self.admit(&backend).await {
                Some(p) => p,
                None => {
                    last_error = Some(Error::backend_unavailable(format!(
                        "backend {} at capacity",
                        backend.id
                    )));
                    attempts += 1;
                    continue;
                }
            };

            let started = Instant::now();
            match client::open_stream(
                &self.http,
                &backend.base_url,
                &request.model,
                &request.messages,
                &request.options,
            )
            .await
            {
                Ok(inner) => {
                    health::record_success(&backend, &self.config).await;
                    let guard = FlightGuard::new(backend.clone(), permit, started);
                    let relay = RelayStream::new(
                        inner,
                        guard,
                        if request.no_cache {
                            None
                        } else {
                            Some((self.cache.clone(), cache_key.clone(), self.cache_ttl))
                        },
                    );
                    return Ok(Box::pin(relay));
                }
                Err(BackendError::ModelNotFound) => {
                    tracing::warn!(backend = %backend.id, model = %request.model,
                        "model not advertised after all, unlisting");
                    backend.state.write().await.models.remove(&request.model);
                    drop(permit);
                    // Unlisting is not a failure of the backend itself.
                    last_error = Some(Error::backend_unavailable(format!(
                        "model {} not available",
                        request.model
                    )));
                }
                Err(BackendError::Transient(msg)) => {
                    tracing::warn!(backend = %backend.id, error = %msg, "backend failed, failing over");
                    health::record_failure(&backend, &self.config).await;
                    Metrics::incr(&self.metrics.llm_failovers);
                    drop(permit);
                    last_error = Some(Error::upstream(msg));
                    attempts += 1;
                }
                Err(BackendError::Fatal(msg)) => {
                    drop(permit);
                    return Err(Error::internal(msg));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::backend_unavailable("no backend advertises the model")))
    }

    /// Choose the least-loaded healthy backend advertising `model`.
    async fn pick_backend(&self, model: &str, tried: &HashSet<String>) -> Option<Arc<Backend>> {
        let mut best: Option<(usize, f64, Arc<Backend>)> = None;
        for backend in &self.backends {
            if !backend.enabled || tried.contains(&backend.id) {
                continue;
            }
            let state = backend.state.read().await;
            if state.health == Health::Down {
                continue;
            }
            // Unknown health with an empty model list is allowed through:
            // the first request doubles as a probe.
            if !state.models.is_empty() && !state.models.contains(model) {
                continue;
            }
            let in_flight = backend.in_flight.load(Ordering::Relaxed);
            let latency = state.ewma_latency_ms;
            let better = match &best {
                Some((bf, bl, _)) => in_flight < *bf || (in_flight == *bf && latency < *bl),
                None => true,
            };
            if better {
                best = Some((in_flight, latency, backend.clone()));
            }
        }
        best.map(|(_, _, b)| b)
    }

    /// Acquire a concurrency permit within the admission wait.
    async fn admit(&self, backend: &Arc<Backend>) -> Option<OwnedSemaphorePermit> {
        let semaphore = backend.semaphore.clone();
        match semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let wait = Duration::from_millis(self.config.admission_wait_ms);
                tokio::time::timeout(wait, semaphore.acquire_owned())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            }
        }
    }
}

fn completion_cache_key(request: &GenerateRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&request.model);
    hasher.update(serde_json::to_vec(&request.messages).unwrap_or_default());
    hasher.update(serde_json::to_vec(&request.options).unwrap_or_default());
    Cache::key("llm", "", &format!("{:x}", hasher.finalize())[..32].to_string())
}

/// Tracks one in-flight request: bumps the counter on creation, records
/// latency and releases the permit when dropped (including client
/// cancellation, which also aborts the upstream connection by dropping
/// the inner stream).
struct FlightGuard {
    backend: Arc<Backend>,
    _permit: OwnedSemaphorePermit,
    started: Instant,
}

impl FlightGuard {
    fn new(backend: Arc<Backend>, permit: OwnedSemaphorePermit, started: Instant) -> Self {
        backend.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            backend,
            _permit: permit,
            started,
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
        let elapsed_ms = self.started.elapsed().as_millis() as f64;
        let backend = self.backend.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut state = backend.state.write().await;
                state.ewma_latency_ms = if state.ewma_latency_ms == 0.0 {
                    elapsed_ms
                } else {
                    0.8 * state.ewma_latency_ms + 0.2 * elapsed_ms
                };
            });
        }
    }
}

/// Relays tokens, accumulating the full completion so it can be cached on
/// a clean end of stream.
struct RelayStream {
    inner: client::TokenStream,
    _guard: FlightGuard,
    accumulated: String,
    failed: bool,
    cache_slot: Option<(Cache, String, Duration)>,
}

impl RelayStream {
    fn new(
        inner: client::TokenStream,
        guard: FlightGuard,
        cache_slot: Option<(Cache, String, Duration)>,
    ) -> Self {
        Self {
            inner,
            _guard: guard,
            accumulated: String::new(),
            failed: false,
            cache_slot,
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(token))) => {
                self.accumulated.push_str(&token);
                Poll::Ready(Some(Ok(token)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.failed = true;
                Poll::Ready(Some(Err(Error::upstream(e.to_string()))))
            }
            Poll::Ready(None) => {
                if !self.failed && !self.accumulated.is_empty() {
                    if let Some((cache, key, ttl)) = self.cache_slot.take() {
                        let text = std::mem::take(&mut self.accumulated);
                        tokio::spawn(async move {
                            cache.put(key, text.into_bytes(), ttl).await;
                        });
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn cluster_config() -> LlmConfig {
        LlmConfig {
            max_retries: 2,
            admission_wait_ms: 100,
            ..Default::default()
        }
    }

    fn sse_body(tokens: &[&str]) -> String {
        let mut body = String::new();
        for token in tokens {
            let chunk = serde_json::json!({ "choices": [{ "delta": { "content": token } }] });
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn request(model: &str) -> GenerateRequest {
        GenerateRequest {
            model: model.into(),
            messages: vec![ChatMessage::user("hello")],
            options: SamplingOptions::default(),
            no_cache: false,
        }
    }

    async fn collect_text(mut stream: TokenStream) -> String {
        let mut out = String::new();
        while let Some(token) = stream.next().await {
            out.push_str(&token.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_generate_streams_from_single_backend() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["Sun", "haven"]));
        });

        let cluster = LlmCluster::from_urls(
            &[server.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );
        let stream = cluster.generate(request("m")).await.unwrap();
        assert_eq!(collect_text(stream).await, "Sunhaven");
    }

    #[tokio::test]
    async fn test_failover_to_second_backend() {
        let bad = httpmock::MockServer::start();
        bad.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(503).body("down");
        });
        let good = httpmock::MockServer::start();
        good.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["ok"]));
        });

        let cluster = LlmCluster::from_urls(
            &[bad.base_url(), good.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );
        let stream = cluster.generate(request("m")).await.unwrap();
        assert_eq!(collect_text(stream).await, "ok");
    }

    #[tokio::test]
    async fn test_all_backends_failing_yields_error() {
        let bad = httpmock::MockServer::start();
        bad.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(500).body("boom");
        });

        let cluster = LlmCluster::from_urls(
            &[bad.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );
        let err = cluster.generate(request("m")).await.map(|_| ()).unwrap_err();
        assert!(matches!(
            err,
            Error::UpstreamTransient(_) | Error::BackendUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["cached ", "answer"]));
        });

        let cluster = LlmCluster::from_urls(
            &[server.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );

        let first = cluster.generate(request("m")).await.unwrap();
        assert_eq!(collect_text(first).await, "cached answer");

        // Let the cache write task land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = cluster.generate(request("m")).await.unwrap();
        assert_eq!(collect_text(second).await, "cached answer");
        assert_eq!(mock.hits(), 1, "second request must not reach the backend");
    }

    #[tokio::test]
    async fn test_no_cache_bypasses_cache() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["fresh"]));
        });

        let cluster = LlmCluster::from_urls(
            &[server.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );

        let mut req = request("m");
        req.no_cache = true;
        collect_text(cluster.generate(req.clone()).await.unwrap()).await;
        collect_text(cluster.generate(req).await.unwrap()).await;
        assert_eq!(mock.hits(), 2);
    }

    #[tokio::test]
    async fn test_model_not_found_unlists_and_fails() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/chat/completions");
            then.status(404).body("unknown model");
        });

        let cluster = LlmCluster::from_urls(
            &[server.base_url()],
            cluster_config(),
            Cache::new(),
            3600,
            Metrics::new(),
        );
        // Advertise the model first so routing would normally accept it.
        cluster.backends()[0]
            .state
            .write()
            .await
            .models
            .insert("ghost".into());

        let err = cluster.generate(request("ghost")).await.map(|_| ()).unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
        assert!(!cluster.backends()[0]
            .state
            .read()
            .await
            .models
            .contains("ghost"));
    }
}
