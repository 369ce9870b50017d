//! Embedding worker: keeps the vector and lexical indices in sync with
//! the document store.
//!
//! The worker wakes on document-changed events from the crawler and
//! upload paths, and on a periodic scan tick. Within a project it
//! observes documents in `fetched_at` order; `indexed_at` is the restart
//! checkpoint, so a crash resumes exactly where it left off. Projects
//! with an active crawl are deferred until a cool-down after the crawl
//! ends, batching index churn instead of racing the fetcher.
//!
//! Per-document failures are logged and never block the rest of the
//! scan. Quality pruning removes junk documents (too short, no real
//! text) from the active indices while retaining the stored row.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, EmbeddingConfig, IndexerConfig};
use crate::documents;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::{self, ChunkVectors};
use crate::metrics::Metrics;
use crate::qa;

/// Signal that a document's content changed and needs (re)indexing.
#[derive(Debug, Clone)]
pub struct DocumentChanged {
    pub project: String,
    pub document_id: String,
}

pub struct Indexer {
    pool: SqlitePool,
    config: IndexerConfig,
    chunking: ChunkingConfig,
    embedding_config: EmbeddingConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Cache,
    metrics: Arc<Metrics>,
}

impl Indexer {
    pub fn new(
        pool: SqlitePool,
        config: IndexerConfig,
        chunking: ChunkingConfig,
        embedding_config: EmbeddingConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Cache,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            chunking,
            embedding_config,
            embedder,
            cache,
            metrics,
        })
    }

    /// Run the worker until the process exits. `rx` is the bounded
    /// change-event channel fed by the crawler and the upload handlers.
    pub fn start(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<DocumentChanged>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // Wake on the first event or the tick, then drain the
                // queue: one scan covers any number of queued events.
                tokio::select! {
                    changed = rx.recv() => {
                        if changed.is_none() {
                            return;
                        }
                        while rx.try_recv().is_ok() {}
                    }
                    _ = tick.tick() => {}
                }

                if let Err(e) = self.scan_once().await {
                    tracing::error!(error = %e, "indexer scan failed");
                }
            }
        })
    }

    /// One full pass over all projects with pending documents.
    pub async fn scan_once(&self) -> Result<()> {
        self.prune_pass().await?;

        let projects = documents::projects_with_pending(&self.pool).await?;
        for project in projects {
            if self.crawl_active_or_cooling(&project).await? {
                tracing::debug!(project, "crawl active, deferring indexing");
                continue;
            }
            self.index_project(&project).await;
        }
        Ok(())
    }

    /// A project is deferred while a crawl runs and for a cool-down
    /// after it finishes.
    async fn crawl_active_or_cooling(&self, project: &str) -> Result<bool> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM crawl_jobs WHERE project_slug = ? AND status IN ('pending','running')",
        )
        .bind(project)
        .fetch_one(&self.pool)
        .await?;
        if active > 0 {
            return Ok(true);
        }

        let cooldown = self.config.crawl_cooldown_secs as i64;
        if cooldown > 0 {
            let last_finish: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(finished_at) FROM crawl_jobs WHERE project_slug = ?",
            )
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
            if let Some(finished_at) = last_finish {
                if chrono::Utc::now().timestamp() - finished_at < cooldown {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Index one project's pending documents, oldest first. Failures on a
    /// document are recorded and do not block the others.
    pub async fn index_project(&self, project: &str) {
        let pending =
            match documents::pending_documents(&self.pool, project, self.config.batch_limit).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(project, error = %e, "pending scan failed");
                    return;
                }
            };
        if pending.is_empty() {
            return;
        }

        let mut published = 0u64;
        for doc in &pending {
            match self.index_document(project, &doc.id, &doc.text).await {
                Ok(()) => {
                    published += 1;
                    Metrics::incr(&self.metrics.documents_indexed);
                }
                Err(e) => {
                    tracing::warn!(project, document = %doc.id, error = %e, "indexing failed");
                }
            }
        }

        // QA questions ride along on the same provider.
        if self.embedding_config.is_enabled() {
            if let Err(e) = qa::embed_missing(
                &self.pool,
                project,
                self.embedder.as_ref(),
                self.embedding_config.batch_size,
            )
            .await
            {
                tracing::warn!(project, error = %e, "QA embedding failed");
            }
        }

        if published > 0 {
            // Rebuilt indices invalidate the project's retrieval cache.
            self.cache.invalidate("retrieval", project).await;
            tracing::info!(project, published, "indexed documents");
        }
    }

    async fn index_document(&self, project: &str, document_id: &str, text: &str) -> Result<()> {
        if !passes_quality(text, self.config.min_text_chars) {
            sqlx::query("UPDATE documents SET pruned = 1, indexed_at = fetched_at WHERE id = ?")
                .bind(document_id)
                .execute(&self.pool)
                .await?;
            index::remove_document_chunks(&self.pool, document_id).await?;
            tracing::debug!(project, document = %document_id, "pruned low-quality document");
            return Ok(());
        }

        let chunks = chunk_text(
            document_id,
            text,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
        );

        if self.embedding_config.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
            for batch in texts.chunks(self.embedding_config.batch_size.max(1)) {
                vectors.extend(self.embedder.embed(batch).await?);
            }
            index::publish_chunks(
                &self.pool,
                project,
                document_id,
                &chunks,
                Some(ChunkVectors {
                    vectors: &vectors,
                    model: self.embedder.model_name(),
                    dims: self.embedder.dims(),
                }),
            )
            .await?;
        } else {
            // Lexical-only corpus: permitted when embeddings are
            // configured off; retrieval reports degraded.
            index::publish_chunks(&self.pool, project, document_id, &chunks, None).await?;
        }

        Ok(())
    }

    /// Remove already-indexed documents that fail the quality floor.
    async fn prune_pass(&self) -> Result<()> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM documents WHERE pruned = 0 AND indexed_at IS NOT NULL AND LENGTH(text) < ?",
        )
        .bind(self.config.min_text_chars as i64)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in rows {
            sqlx::query("UPDATE documents SET pruned = 1 WHERE id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            index::remove_document_chunks(&self.pool, &id).await?;
            tracing::info!(document = %id, "pruned indexed document below quality floor");
        }
        Ok(())
    }
}

/// Quality floor: enough characters, and mostly real text rather than
/// markup debris.
fn passes_quality(text: &str, min_chars: usize) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < min_chars {
        return false;
    }
    let total = trimmed.chars().count() as f64;
    let wordlike = trimmed
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .count() as f64;
    wordlike / total >= 0.5
}
