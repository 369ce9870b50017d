//! Core data models used throughout the platform.
//!
//! These types represent the projects, documents, chunks, crawl jobs and
//! retrieval results that flow through the ingestion and answering pipeline.
//! Every content-bearing type carries its project slug; nothing crosses a
//! project boundary.

use serde::{Deserialize, Serialize};

/// A tenant namespace. All content and policy is scoped to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Lowercase slug, unique.
    pub slug: String,
    pub title: String,
    /// Declared web domain; the crawler refuses hosts outside it.
    pub domain: Option<String>,
    /// Model selector for the LLM cluster.
    pub llm_model: Option<String>,
    pub system_prompt: Option<String>,
    pub enabled: bool,
    pub emotions_enabled: bool,
    pub voice_enabled: bool,
    pub sources_enabled: bool,
    pub captions_enabled: bool,
    pub debug_enabled: bool,
    pub crm_webhook_url: Option<String>,
    pub mail_webhook_url: Option<String>,
    pub bot_token: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOrigin {
    Crawl,
    Upload,
}

impl DocumentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentOrigin::Crawl => "crawl",
            DocumentOrigin::Upload => "upload",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "upload" => DocumentOrigin::Upload,
            _ => DocumentOrigin::Crawl,
        }
    }
}

/// Normalized document stored in SQLite. Deduplicated within a project by
/// the SHA-256 of its extracted text.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub project_slug: String,
    pub content_hash: String,
    pub source_url: Option<String>,
    pub origin: DocumentOrigin,
    pub mime: String,
    pub title: Option<String>,
    pub text: String,
    pub description: Option<String>,
    pub priority: f64,
    pub fetched_at: i64,
    /// Indexing checkpoint; `None` until the embedding worker publishes.
    pub indexed_at: Option<i64>,
}

/// A chunk of a document's text. Rebuilt, never edited.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub text_hash: String,
}

/// Crawl job lifecycle states. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Running,
    Done,
    Stopped,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::Running => "running",
            CrawlStatus::Done => "done",
            CrawlStatus::Stopped => "stopped",
            CrawlStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => CrawlStatus::Pending,
            "running" => CrawlStatus::Running,
            "done" => CrawlStatus::Done,
            "stopped" => CrawlStatus::Stopped,
            _ => CrawlStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlStatus::Done | CrawlStatus::Stopped | CrawlStatus::Failed
        )
    }
}

/// Progress counters for a crawl job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CrawlCounters {
    pub queued: i64,
    pub in_progress: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlJob {
    pub id: String,
    pub project_slug: String,
    pub seed_url: String,
    pub max_depth: u32,
    pub max_pages: u32,
    pub status: CrawlStatus,
    pub counters: CrawlCounters,
    pub last_url: Option<String>,
    pub last_error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Manually curated high-priority knowledge; matched before retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct QaPair {
    pub id: String,
    pub project_slug: String,
    pub question: String,
    pub answer: String,
    pub priority: f64,
}

/// A retrieval hit with enough metadata to cite its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub excerpt: String,
    pub score: f64,
}

/// Result of a hybrid search, flagged when produced without one of the
/// indices or the reranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<SearchHit>,
    pub degraded: bool,
}

/// One conversation turn, bounded per session/request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub text: String,
    pub at: i64,
}

/// A side effect requested by the model, executed at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CrmTicket,
    Email,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CrmTicket => "crm_ticket",
            ActionKind::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crm_ticket" => Some(ActionKind::CrmTicket),
            "email" => Some(ActionKind::Email),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_status_roundtrip() {
        for s in [
            CrawlStatus::Pending,
            CrawlStatus::Running,
            CrawlStatus::Done,
            CrawlStatus::Stopped,
            CrawlStatus::Failed,
        ] {
            assert_eq!(CrawlStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CrawlStatus::Pending.is_terminal());
        assert!(!CrawlStatus::Running.is_terminal());
        assert!(CrawlStatus::Done.is_terminal());
        assert!(CrawlStatus::Stopped.is_terminal());
        assert!(CrawlStatus::Failed.is_terminal());
    }

    #[test]
    fn test_action_kind_parse() {
        assert_eq!(ActionKind::parse("crm_ticket"), Some(ActionKind::CrmTicket));
        assert_eq!(ActionKind::parse("email"), Some(ActionKind::Email));
        assert_eq!(ActionKind::parse("rm -rf"), None);
    }
}
