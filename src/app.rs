//! Process-wide service wiring: explicit init and shutdown.
//!
//! `App` owns every long-lived component and the channels between them.
//! No component holds a pointer into another component's internals; the
//! crawler talks to the indexer over a bounded channel, the orchestrator
//! calls the retriever and cluster through their public surfaces, and
//! handlers receive the whole `App` by reference.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::actions::ActionDispatcher;
use crate::cache::Cache;
use crate::config::Config;
use crate::crawler::Crawler;
use crate::db;
use crate::embedding;
use crate::gate::RequestGate;
use crate::indexer::{DocumentChanged, Indexer};
use crate::llm::{health, LlmCluster};
use crate::metrics::Metrics;
use crate::migrate;
use crate::orchestrator::Orchestrator;
use crate::rerank;
use crate::retriever::Retriever;
use crate::voice::VoiceManager;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub cache: Cache,
    pub gate: RequestGate,
    pub metrics: Arc<Metrics>,
    pub cluster: Arc<LlmCluster>,
    pub retriever: Arc<Retriever>,
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub crawler: Arc<Crawler>,
    pub indexer: Arc<Indexer>,
    pub voice: Arc<VoiceManager>,
    /// Upload handlers signal the indexer here, same as the crawler.
    pub doc_tx: mpsc::Sender<DocumentChanged>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl App {
    /// Connect, migrate, and wire every component. Background tasks are
    /// not started; call [`App::start_background`] from the server path.
    pub async fn init(config: Config) -> anyhow::Result<Arc<Self>> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;
        Crawler::recover_orphans(&pool).await?;

        let cache = Cache::new();
        let metrics = Metrics::new();
        let gate = RequestGate::new(config.rate_limit.clone());

        let embedder: Arc<dyn embedding::EmbeddingProvider> =
            embedding::create_provider(&config.embedding)?.into();
        let reranker: Option<Arc<dyn rerank::Reranker>> =
            rerank::create_reranker(&config.rerank)?.map(Into::into);

        let cluster = Arc::new(
            LlmCluster::load(
                &pool,
                config.llm.clone(),
                cache.clone(),
                config.cache.ttl_llm_secs,
                metrics.clone(),
            )
            .await?,
        );

        let retriever = Arc::new(Retriever::new(
            pool.clone(),
            config.retrieval.clone(),
            config.cache.clone(),
            cache.clone(),
            embedder.clone(),
            reranker,
        ));

        let dispatcher = ActionDispatcher::new(
            pool.clone(),
            config.actions.clone(),
            metrics.clone(),
            config.crawler.allow_private_networks,
        )?;

        let orchestrator = Orchestrator::new(
            pool.clone(),
            retriever.clone(),
            cluster.clone(),
            dispatcher.clone(),
            config.prompt.clone(),
            config.retrieval.final_k,
            metrics.clone(),
        );

        let (doc_tx, doc_rx) = mpsc::channel(config.crawler.doc_queue_depth.max(1));
        let crawler = Crawler::new(
            pool.clone(),
            config.crawler.clone(),
            doc_tx.clone(),
            metrics.clone(),
        );

        let indexer = Indexer::new(
            pool.clone(),
            config.indexer.clone(),
            config.chunking.clone(),
            config.embedding.clone(),
            embedder,
            cache.clone(),
            metrics.clone(),
        );

        let voice = VoiceManager::new(
            pool.clone(),
            config.voice.clone(),
            config.cache.ttl_tts_secs,
            orchestrator.clone(),
            metrics.clone(),
        )?;

        let app = Arc::new(Self {
            config,
            pool,
            cache,
            gate,
            metrics,
            cluster,
            retriever,
            orchestrator,
            dispatcher,
            crawler,
            indexer,
            voice,
            doc_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // The channel receiver is handed to the indexer task at start;
        // park it until then.
        app.tasks
            .lock()
            .await
            .push(app.indexer.clone().start(doc_rx));

        Ok(app)
    }

    /// Start the supervised background tasks: LLM health loop, action
    /// worker, voice reaper, cache purge.
    pub async fn start_background(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(health::start_health_loop(self.cluster.clone()));
        tasks.push(self.dispatcher.clone().start());
        tasks.push(self.voice.clone().start_reaper());
        tasks.push(self.cache.start_purge_task(Duration::from_secs(60)));
    }

    /// Abort all background tasks. In-flight requests finish on their
    /// own; persistent state (action jobs, crawl rows) is crash-safe.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_init_and_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db.path = tmp.path().join("app.sqlite");

        let app = App::init(config).await.unwrap();
        app.start_background().await;

        // Everything is wired; a trivial readout works.
        assert!(app.cluster.statuses().await.is_empty());
        assert_eq!(app.cache.len().await, 0);

        app.shutdown().await;
    }
}
