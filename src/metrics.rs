//! Minimal request counters rendered in Prometheus text format.
//!
//! Full metrics plumbing (exporter, histograms, per-route labels) lives in
//! the operator stack outside this crate; the `/metrics` endpoint here
//! exposes just enough for a scrape target to stay green.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Metrics {
    pub chat_requests: AtomicU64,
    pub chat_errors: AtomicU64,
    pub crawl_pages_fetched: AtomicU64,
    pub crawl_pages_failed: AtomicU64,
    pub documents_indexed: AtomicU64,
    pub llm_requests: AtomicU64,
    pub llm_failovers: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub rate_limited: AtomicU64,
    pub voice_sessions_started: AtomicU64,
    pub actions_executed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &AtomicU64); 12] = [
            ("answer_chat_requests_total", &self.chat_requests),
            ("answer_chat_errors_total", &self.chat_errors),
            ("answer_crawl_pages_fetched_total", &self.crawl_pages_fetched),
            ("answer_crawl_pages_failed_total", &self.crawl_pages_failed),
            ("answer_documents_indexed_total", &self.documents_indexed),
            ("answer_llm_requests_total", &self.llm_requests),
            ("answer_llm_failovers_total", &self.llm_failovers),
            ("answer_cache_hits_total", &self.cache_hits),
            ("answer_cache_misses_total", &self.cache_misses),
            ("answer_rate_limited_total", &self.rate_limited),
            ("answer_voice_sessions_started_total", &self.voice_sessions_started),
            ("answer_actions_executed_total", &self.actions_executed),
        ];
        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }
        out
    }
}
