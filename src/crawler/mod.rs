//! Polite, concurrent, depth- and count-bounded web crawler.
//!
//! Each project runs at most one crawl job at a time. A job owns an
//! in-memory BFS frontier; a fixed worker pool drains it, with a
//! per-origin politeness throttle, robots.txt honoured per origin, SSRF
//! checks on every fetch, and bounded retries. Successful pages land in
//! the document store and signal the embedding worker over a bounded
//! channel, so a saturated indexer back-pressures the crawl rather than
//! being flooded.
//!
//! Individual URL failures never fail the job; they increment counters
//! and are recorded for the admin log stream. The job itself fails only
//! when it cannot start or the seed is unreachable after all retries.
//! Cancellation is cooperative and always honoured between fetches.

pub mod fetch;
pub mod politeness;
pub mod robots;
pub mod safety;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use url::Url;
use uuid::Uuid;

use crate::config::CrawlerConfig;
use crate::documents::{self, NewDocument};
use crate::error::{Error, Result};
use crate::extract;
use crate::indexer::DocumentChanged;
use crate::metrics::Metrics;
use crate::models::{CrawlCounters, CrawlJob, CrawlStatus, DocumentOrigin, Project};

use politeness::OriginThrottle;
use robots::RobotsCache;
use safety::UrlPolicy;

/// Caller-supplied crawl parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRequest {
    pub start_url: String,
    #[serde(default = "default_depth")]
    pub max_depth: u32,
    #[serde(default = "default_pages")]
    pub max_pages: u32,
    /// Honour robots.txt; on by default.
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    /// Merge sitemap.xml URLs into the frontier.
    #[serde(default = "default_true")]
    pub use_sitemap: bool,
    #[serde(default)]
    pub allow_hosts: Vec<String>,
    #[serde(default)]
    pub block_hosts: Vec<String>,
}

fn default_depth() -> u32 {
    2
}
fn default_pages() -> u32 {
    100
}
fn default_true() -> bool {
    true
}

const MAX_DEPTH_CAP: u32 = 16;
const MAX_PAGES_CAP: u32 = 50_000;
const MAX_SITEMAP_URLS: usize = 1_000;

/// Progress event published to the admin log stream.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlEvent {
    pub job_id: String,
    pub event: CrawlEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlEventKind {
    Discovered,
    Fetched,
    Failed,
    Done,
}

struct JobHandle {
    job_id: String,
    cancel: watch::Sender<bool>,
}

/// The crawl service: one per process, jobs keyed by project.
pub struct Crawler {
    pool: SqlitePool,
    config: CrawlerConfig,
    doc_tx: mpsc::Sender<DocumentChanged>,
    running: Mutex<HashMap<String, JobHandle>>,
    events: broadcast::Sender<CrawlEvent>,
    metrics: Arc<Metrics>,
}

impl Crawler {
    pub fn new(
        pool: SqlitePool,
        config: CrawlerConfig,
        doc_tx: mpsc::Sender<DocumentChanged>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            pool,
            config,
            doc_tx,
            running: Mutex::new(HashMap::new()),
            events,
            metrics,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.events.subscribe()
    }

    /// Jobs left `running` by a previous process cannot resume (the
    /// frontier was in memory); mark them failed at startup.
    pub async fn recover_orphans(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE crawl_jobs SET status = 'failed', last_error = 'interrupted by restart',
             finished_at = ? WHERE status IN ('pending', 'running')",
        )
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Start a crawl for `project`. Fails with `Conflict` when a
    /// non-terminal job exists, and with `ValidationError` when the seed
    /// is rejected.
    pub async fn start(self: &Arc<Self>, project: &Project, request: CrawlRequest) -> Result<String> {
        if request.max_pages == 0 || request.max_pages > MAX_PAGES_CAP {
            return Err(Error::validation(
                "max_pages",
                format!("must be in 1..={}", MAX_PAGES_CAP),
            ));
        }
        if request.max_depth > MAX_DEPTH_CAP {
            return Err(Error::validation(
                "max_depth",
                format!("must be <= {}", MAX_DEPTH_CAP),
            ));
        }

        let seed = fetch::normalize_url(None, &request.start_url)
            .ok_or_else(|| Error::validation("start_url", "not a valid http(s) URL"))?;

        // Default domain restriction: the project's declared domain, or
        // the seed's host when none is declared.
        let domain = project
            .domain
            .clone()
            .or_else(|| seed.host_str().map(String::from));
        let mut policy =
            UrlPolicy::with_patterns(domain.as_deref(), &request.allow_hosts, &request.block_hosts)
                .map_err(|e| Error::validation("allow_hosts", e.to_string()))?;
        policy.allow_private = self.config.allow_private_networks;

        safety::check_url(&seed, &policy).await?;

        {
            let mut running = self.running.lock().await;
            if running.contains_key(&project.slug) {
                return Err(Error::conflict("a crawl is already running for this project"));
            }
            let open_jobs: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM crawl_jobs WHERE project_slug = ? AND status IN ('pending','running')",
            )
            .bind(&project.slug)
            .fetch_one(&self.pool)
            .await?;
            if open_jobs > 0 {
                return Err(Error::conflict("a crawl is already running for this project"));
            }

            let job_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO crawl_jobs (id, project_slug, seed_url, max_depth, max_pages,
                 status, started_at) VALUES (?, ?, ?, ?, ?, 'running', ?)",
            )
            .bind(&job_id)
            .bind(&project.slug)
            .bind(seed.as_str())
            .bind(request.max_depth as i64)
            .bind(request.max_pages as i64)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let crawler = Arc::clone(self);
            let slug = project.slug.clone();
            let job = RunningJob {
                job_id: job_id.clone(),
                project: project.slug.clone(),
                seed,
                request,
                policy,
            };
            tokio::spawn(async move {
                crawler.run_job(job, cancel_rx).await;
                crawler.running.lock().await.remove(&slug);
            });

            running.insert(
                project.slug.clone(),
                JobHandle {
                    job_id: job_id.clone(),
                    cancel: cancel_tx,
                },
            );
            Ok(job_id)
        }
    }

    /// Request cooperative cancellation; the job transitions to `stopped`
    /// at the next safe point. A no-op when nothing is running.
    pub async fn stop(&self, project: &str) -> Result<()> {
        let running = self.running.lock().await;
        if let Some(handle) = running.get(project) {
            let _ = handle.cancel.send(true);
            tracing::info!(project, job_id = %handle.job_id, "crawl stop requested");
        }
        Ok(())
    }

    /// Latest job for the project, counters included.
    pub async fn status(&self, project: &str) -> Result<Option<CrawlJob>> {
        let row = sqlx::query(
            "SELECT * FROM crawl_jobs WHERE project_slug = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(project)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let status: String = r.get("status");
            CrawlJob {
                id: r.get("id"),
                project_slug: r.get("project_slug"),
                seed_url: r.get("seed_url"),
                max_depth: r.get::<i64, _>("max_depth") as u32,
                max_pages: r.get::<i64, _>("max_pages") as u32,
                status: CrawlStatus::parse(&status),
                counters: CrawlCounters {
                    queued: r.get("queued"),
                    in_progress: r.get("in_progress"),
                    done: r.get("done"),
                    failed: r.get("failed"),
                },
                last_url: r.get("last_url"),
                last_error: r.get("last_error"),
                started_at: r.get("started_at"),
                finished_at: r.get("finished_at"),
            }
        }))
    }

    fn emit(&self, event: CrawlEvent) {
        let _ = self.events.send(event);
    }

    // ============ Job execution ============

    async fn run_job(self: &Arc<Self>, job: RunningJob, cancel: watch::Receiver<bool>) {
        tracing::info!(project = %job.project, job_id = %job.job_id, seed = %job.seed, "crawl started");

        let client = match fetch::build_client(
            &self.config.user_agent,
            Duration::from_secs(self.config.page_timeout_secs),
        ) {
            Ok(c) => c,
            Err(e) => {
                self.finish_job(&job, CrawlStatus::Failed, Some(e.to_string())).await;
                return;
            }
        };

        let robots = Arc::new(RobotsCache::new(client.clone(), self.config.user_agent.clone()));
        let throttle = Arc::new(OriginThrottle::new(Duration::from_millis(
            self.config.politeness_interval_ms,
        )));

        let state = Arc::new(Mutex::new(FrontierState::new(&job.seed)));

        // Seed expansion: sitemap URLs merge into the frontier when the
        // origin permits them.
        if job.request.use_sitemap {
            self.merge_sitemaps(&client, &robots, &job, &state).await;
        }

        let workers: Vec<_> = (0..self.config.max_concurrency.max(1))
            .map(|_| {
                let crawler = Arc::clone(self);
                let job = job.clone();
                let state = Arc::clone(&state);
                let client = client.clone();
                let robots = Arc::clone(&robots);
                let throttle = Arc::clone(&throttle);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    crawler
                        .worker_loop(&job, &state, &client, &robots, &throttle, cancel)
                        .await;
                })
            })
            .collect();

        for worker in workers {
            let _ = worker.await;
        }

        let (status, error) = {
            let state = state.lock().await;
            if *cancel.borrow() {
                (CrawlStatus::Stopped, None)
            } else if state.seed_failed && state.done == 0 {
                (
                    CrawlStatus::Failed,
                    Some(
                        state
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "seed unreachable".into()),
                    ),
                )
            } else {
                (CrawlStatus::Done, None)
            }
        };

        self.persist_counters(&job, &*state.lock().await, true).await;
        self.finish_job(&job, status, error).await;
    }

    async fn worker_loop(
        &self,
        job: &RunningJob,
        state: &Arc<Mutex<FrontierState>>,
        client: &reqwest::Client,
        robots: &Arc<RobotsCache>,
        throttle: &Arc<OriginThrottle>,
        cancel: watch::Receiver<bool>,
    ) {
        loop {
            if *cancel.borrow() {
                return;
            }

            let next = {
                let mut state = state.lock().await;
                if state.budget_spent() >= job.request.max_pages {
                    if state.in_progress == 0 {
                        return;
                    }
                    Dispense::Wait
                } else {
                    match state.queue.pop_front() {
                        Some(item) => {
                            state.in_progress += 1;
                            Dispense::Item(item)
                        }
                        None if state.in_progress == 0 => return,
                        None => Dispense::Wait,
                    }
                }
            };

            let (url, depth) = match next {
                Dispense::Item(item) => item,
                Dispense::Wait => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let is_seed = depth == 0;
            let outcome = self
                .process_url(job, &url, depth, client, robots, throttle)
                .await;

            let mut state = state.lock().await;
            state.in_progress -= 1;

            // A stop that arrived while this fetch was in flight discards
            // its outcome; the job ends with the counters it had.
            if *cancel.borrow() {
                return;
            }
            state.last_url = Some(url.to_string());

            match outcome {
                UrlOutcome::Fetched { links } => {
                    state.done += 1;
                    Metrics::incr(&self.metrics.crawl_pages_fetched);
                    self.emit(CrawlEvent {
                        job_id: job.job_id.clone(),
                        event: CrawlEventKind::Fetched,
                        url: Some(url.to_string()),
                        error: None,
                    });
                    if depth < job.request.max_depth {
                        for link in links {
                            if state.mark_seen(&link) {
                                state.queue.push_back((link.clone(), depth + 1));
                                self.emit(CrawlEvent {
                                    job_id: job.job_id.clone(),
                                    event: CrawlEventKind::Discovered,
                                    url: Some(link.to_string()),
                                    error: None,
                                });
                            }
                        }
                    }
                }
                UrlOutcome::Failed { error } => {
                    state.failed += 1;
                    if is_seed {
                        state.seed_failed = true;
                    }
                    state.last_error = Some(error.clone());
                    Metrics::incr(&self.metrics.crawl_pages_failed);
                    self.emit(CrawlEvent {
                        job_id: job.job_id.clone(),
                        event: CrawlEventKind::Failed,
                        url: Some(url.to_string()),
                        error: Some(error),
                    });
                }
            }

            self.persist_counters(job, &state, false).await;
        }
    }

    async fn process_url(
        &self,
        job: &RunningJob,
        url: &Url,
        _depth: u32,
        client: &reqwest::Client,
        robots: &Arc<RobotsCache>,
        throttle: &Arc<OriginThrottle>,
    ) -> UrlOutcome {
        if let Err(e) = safety::check_url(url, &job.policy).await {
            return UrlOutcome::Failed {
                error: format!("rejected: {}", e),
            };
        }

        let origin = fetch::origin_of(url);

        if job.request.respect_robots {
            let rules = robots.rules_for(&origin).await;
            if !rules.is_allowed(url.path()) {
                return UrlOutcome::Failed {
                    error: "disallowed by robots.txt".into(),
                };
            }
        }

        throttle.wait_turn(&origin).await;

        let page = match fetch::fetch_page(
            client,
            url,
            self.config.max_body_bytes,
            self.config.max_retries,
        )
        .await
        {
            Ok(page) => page,
            Err(e) => {
                return UrlOutcome::Failed {
                    error: format!(
                        "fetch failed{}: {}",
                        e.status().map(|s| format!(" ({})", s)).unwrap_or_default(),
                        e
                    ),
                }
            }
        };

        let is_html = page.content_type.starts_with("text/html")
            || page.content_type.starts_with("application/xhtml");

        let body = if is_html {
            self.maybe_render(client, url, page.body).await
        } else {
            page.body
        };

        let extracted = match extract::extract_text(&body, &page.content_type) {
            Ok(e) => e,
            Err(e) => {
                return UrlOutcome::Failed {
                    error: format!("extraction failed: {}", e),
                }
            }
        };
        if extracted.text.trim().is_empty() {
            return UrlOutcome::Failed {
                error: "no extractable text".into(),
            };
        }

        let links = if is_html {
            let html = String::from_utf8_lossy(&body);
            fetch::extract_links(&html, &page.final_url)
                .into_iter()
                .filter(|link| quick_policy_check(link, &job.policy))
                .collect()
        } else {
            Vec::new()
        };

        // Binary formats keep their original bytes alongside the text.
        let blob = if is_html || page.content_type.starts_with("text/") {
            None
        } else {
            Some(body)
        };

        let new_doc = NewDocument {
            source_url: Some(page.final_url.to_string()),
            origin: DocumentOrigin::Crawl,
            mime: page
                .content_type
                .split(';')
                .next()
                .unwrap_or("text/html")
                .to_string(),
            title: extracted.title,
            text: extracted.text,
            description: None,
            priority: 0.0,
            blob,
        };

        match documents::upsert_document(&self.pool, &job.project, new_doc).await {
            Ok(outcome) => {
                if outcome.changed() {
                    // Bounded channel: a saturated indexer pauses the
                    // crawl workers here instead of dropping work.
                    let _ = self
                        .doc_tx
                        .send(DocumentChanged {
                            project: job.project.clone(),
                            document_id: outcome.document_id().to_string(),
                        })
                        .await;
                }
                UrlOutcome::Fetched { links }
            }
            Err(e) => UrlOutcome::Failed {
                error: format!("store failed: {}", e),
            },
        }
    }

    /// Render via the headless-browser adapter when enabled; best-effort,
    /// bounded by the page timeout.
    async fn maybe_render(&self, client: &reqwest::Client, url: &Url, body: Vec<u8>) -> Vec<u8> {
        if !self.config.js_render {
            return body;
        }
        let Some(ref render_url) = self.config.render_url else {
            return body;
        };

        let response = client
            .post(render_url)
            .json(&serde_json::json!({ "url": url.as_str() }))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => match r.json::<serde_json::Value>().await {
                Ok(json) => json
                    .get("html")
                    .and_then(|h| h.as_str())
                    .map(|h| h.as_bytes().to_vec())
                    .unwrap_or(body),
                Err(_) => body,
            },
            _ => {
                tracing::debug!(url = %url, "render service unavailable, using raw HTML");
                body
            }
        }
    }

    async fn merge_sitemaps(
        &self,
        client: &reqwest::Client,
        robots: &Arc<RobotsCache>,
        job: &RunningJob,
        state: &Arc<Mutex<FrontierState>>,
    ) {
        let origin = fetch::origin_of(&job.seed);
        let mut candidates = vec![format!("{}/sitemap.xml", origin)];
        if job.request.respect_robots {
            let rules = robots.rules_for(&origin).await;
            candidates.extend(rules.sitemaps.clone());
        }

        let mut merged = 0usize;
        for sitemap_url in candidates {
            let Some(url) = fetch::normalize_url(None, &sitemap_url) else {
                continue;
            };
            let Ok(page) =
                fetch::fetch_page(client, &url, self.config.max_body_bytes, 0).await
            else {
                continue;
            };
            for loc in fetch::parse_sitemap(&page.body) {
                if merged >= MAX_SITEMAP_URLS {
                    return;
                }
                if let Some(link) = fetch::normalize_url(None, &loc) {
                    if quick_policy_check(&link, &job.policy) {
                        let mut state = state.lock().await;
                        if state.mark_seen(&link) {
                            state.queue.push_back((link, 1));
                            merged += 1;
                        }
                    }
                }
            }
        }
        if merged > 0 {
            tracing::info!(project = %job.project, merged, "sitemap URLs merged into frontier");
        }
    }

    async fn persist_counters(&self, job: &RunningJob, state: &FrontierState, terminal: bool) {
        let queued = if terminal { 0 } else { state.queue.len() as i64 };
        let in_progress = if terminal { 0 } else { state.in_progress as i64 };
        let result = sqlx::query(
            "UPDATE crawl_jobs SET queued = ?, in_progress = ?, done = ?, failed = ?,
             last_url = ?, last_error = ? WHERE id = ?",
        )
        .bind(queued)
        .bind(in_progress)
        .bind(state.done as i64)
        .bind(state.failed as i64)
        .bind(&state.last_url)
        .bind(&state.last_error)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!(job_id = %job.job_id, error = %e, "counter persist failed");
        }
    }

    async fn finish_job(&self, job: &RunningJob, status: CrawlStatus, error: Option<String>) {
        let result = sqlx::query(
            "UPDATE crawl_jobs SET status = ?, last_error = COALESCE(?, last_error),
             finished_at = ? WHERE id = ? AND status NOT IN ('done','stopped','failed')",
        )
        .bind(status.as_str())
        .bind(&error)
        .bind(Utc::now().timestamp())
        .bind(&job.job_id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::error!(job_id = %job.job_id, error = %e, "job finalize failed");
        }

        self.emit(CrawlEvent {
            job_id: job.job_id.clone(),
            event: CrawlEventKind::Done,
            url: None,
            error,
        });
        tracing::info!(project = %job.project, job_id = %job.job_id, status = status.as_str(), "crawl finished");
    }
}

/// Synchronous subset of the URL policy, applied at link-discovery time.
/// The full check (with DNS resolution) runs again before the fetch.
fn quick_policy_check(url: &Url, policy: &UrlPolicy) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    if let Some(ref blocked) = policy.block_hosts {
        if blocked.is_match(&host) {
            return false;
        }
    }
    if let Some(ref domain) = policy.declared_domain {
        let allowed = safety::host_in_domain(&host, domain)
            || policy
                .allow_hosts
                .as_ref()
                .map(|set| set.is_match(&host))
                .unwrap_or(false);
        if !allowed {
            return false;
        }
    }
    true
}

#[derive(Clone)]
struct RunningJob {
    job_id: String,
    project: String,
    seed: Url,
    request: CrawlRequest,
    policy: UrlPolicy,
}

enum Dispense {
    Item((Url, u32)),
    Wait,
}

enum UrlOutcome {
    Fetched { links: Vec<Url> },
    Failed { error: String },
}

struct FrontierState {
    queue: VecDeque<(Url, u32)>,
    seen: HashSet<String>,
    in_progress: usize,
    done: u32,
    failed: u32,
    last_url: Option<String>,
    last_error: Option<String>,
    seed_failed: bool,
}

impl FrontierState {
    fn new(seed: &Url) -> Self {
        let mut state = Self {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            in_progress: 0,
            done: 0,
            failed: 0,
            last_url: None,
            last_error: None,
            seed_failed: false,
        };
        state.mark_seen(seed);
        state.queue.push_back((seed.clone(), 0));
        state
    }

    /// Register a URL; returns true when it was not seen before. The
    /// frontier holds each normalized URL at most once per job.
    fn mark_seen(&mut self, url: &Url) -> bool {
        self.seen.insert(url.as_str().to_string())
    }

    fn budget_spent(&self) -> u32 {
        self.done + self.failed + self.in_progress as u32
    }
}
