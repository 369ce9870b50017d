//! # Answer Harness
//!
//! **A multi-tenant retrieval-augmented answering platform for curated
//! web corpora.**
//!
//! Each tenant ("project") gets a crawled or uploaded knowledge base and
//! serves grounded natural-language answers over HTTP streaming and
//! WebSocket voice, citing sources and degrading predictably when the
//! language model or a dependency is unavailable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌───────────────┐
//! │ Crawler │──▶│ Documents │──▶│ Indexer        │
//! │ uploads │   │ (SQLite)  │   │ chunk + embed │
//! └─────────┘   └───────────┘   └──────┬────────┘
//!                                      ▼
//!                         ┌─────────────────────────┐
//!                         │ FTS5 + vector indices   │
//!                         └──────┬──────────────────┘
//!                                ▼
//!   client ◀── SSE/WS ── Orchestrator ── Retriever ── Cache
//!                            │
//!                            ├─▶ LLM cluster (health, failover)
//!                            └─▶ Action dispatcher (CRM, mail)
//! ```
//!
//! ## Data flow
//!
//! 1. The **crawler** ([`crawler`]) fetches pages politely within the
//!    project's domain and writes deduplicated [`models::Document`]s.
//! 2. The **indexer** ([`indexer`]) chunks and embeds changed documents,
//!    publishing both index sides atomically.
//! 3. The **retriever** ([`retriever`]) fuses dense and lexical
//!    candidates with RRF, reranks, and caches results.
//! 4. The **orchestrator** ([`orchestrator`]) builds a bounded prompt
//!    ([`prompt`]), streams tokens from the **LLM cluster** ([`llm`]),
//!    detects model-requested actions ([`actions`]) and attributes
//!    sources.
//! 5. **Voice sessions** ([`voice`]) wrap the orchestrator with STT, TTS
//!    and an audio cache over a WebSocket.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`error`] | Error taxonomy shared by API, workers and CLI |
//! | [`models`] | Core data types |
//! | [`db`] / [`migrate`] | SQLite pool and idempotent schema |
//! | [`projects`] | Tenant namespaces, cascade delete |
//! | [`documents`] | Content-addressed document store |
//! | [`chunk`] / [`extract`] | Chunker and text extraction |
//! | [`embedding`] / [`rerank`] | Model providers |
//! | [`index`] | Vector + lexical index, atomic publication |
//! | [`indexer`] | Background embedding worker |
//! | [`retriever`] | Hybrid search with RRF fusion |
//! | [`llm`] | Backend cluster: health, routing, failover, streaming |
//! | [`prompt`] | Bounded prompt composition with citations |
//! | [`orchestrator`] | End-to-end answer pipeline |
//! | [`actions`] | At-most-once side-effect dispatch |
//! | [`voice`] | Voice session state machine |
//! | [`qa`] | Curated QA pairs and bulk import |
//! | [`gate`] / [`cache`] / [`metrics`] / [`stats`] | Cross-cutting |
//! | [`app`] / [`server`] | Process wiring and the HTTP surface |

pub mod actions;
pub mod app;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod crawler;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod gate;
pub mod index;
pub mod indexer;
pub mod llm;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod projects;
pub mod prompt;
pub mod qa;
pub mod rerank;
pub mod retriever;
pub mod server;
pub mod stats;
pub mod voice;
