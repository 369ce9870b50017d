//! Configuration parsing and validation.
//!
//! The platform is configured via a TOML file (default: `config/answer.toml`)
//! with environment overrides applied after parse. Every deployment knob is
//! enumerated by effect: backing store paths, model selection, crawler
//! behaviour, rate-limit quotas, voice policy, cache TTLs, and transport
//! policy.
//!
//! # Environment overrides
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `DOCUMENT_STORE_URL` | database path (`db.path`) |
//! | `EMBEDDING_MODEL` / `RERANK_MODEL` / `LLM_DEFAULT_MODEL` | model selection |
//! | `CRAWL_MAX_CONCURRENCY` / `CRAWL_PAGE_TIMEOUT` / `CRAWL_JS_RENDER` | crawler |
//! | `RATE_LIMIT_READ_PER_MIN` / `RATE_LIMIT_WRITE_PER_MIN` / `RATE_LIMIT_PER_HOUR` | gating |
//! | `VOICE_SESSION_TIMEOUT` / `VOICE_MAX_CONCURRENT_SESSIONS` | voice policy |
//! | `CACHE_TTL_LLM_RESULTS` / `CACHE_TTL_EMBEDDINGS` / `CACHE_TTL_SEARCH` | TTLs (seconds) |
//! | `ALLOWED_ORIGINS` / `CSRF_SECRET_KEY` / `MAX_UPLOAD_SIZE` | transport policy |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/answer.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins; empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Double-submit token required on admin mutations when set.
    #[serde(default)]
    pub csrf_secret_key: Option<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
            csrf_secret_key: None,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_overlap() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidate fan-out multiplier: k_dense = k_lex = multiplier * k.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: i64,
    /// Reciprocal rank fusion constant.
    #[serde(default = "default_rrf_c")]
    pub rrf_c: f64,
    #[serde(default = "default_final_k")]
    pub final_k: i64,
    /// Cosine similarity above which a QA pair short-circuits retrieval.
    #[serde(default = "default_qa_threshold")]
    pub qa_match_threshold: f32,
    /// Rerank pool multiplier: top rerank_multiplier * k fused hits.
    #[serde(default = "default_rerank_multiplier")]
    pub rerank_multiplier: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: default_candidate_multiplier(),
            rrf_c: default_rrf_c(),
            final_k: default_final_k(),
            qa_match_threshold: default_qa_threshold(),
            rerank_multiplier: default_rerank_multiplier(),
        }
    }
}

fn default_candidate_multiplier() -> i64 {
    4
}
fn default_rrf_c() -> f64 {
    60.0
}
fn default_final_k() -> i64 {
    6
}
fn default_qa_threshold() -> f32 {
    0.92
}
fn default_rerank_multiplier() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_rerank_batch")]
    pub batch_size: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            timeout_secs: default_rerank_timeout(),
            batch_size: default_rerank_batch(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_rerank_timeout() -> u64 {
    10
}
fn default_rerank_batch() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub default_model: String,
    /// Seed backends; merged with the `llm_servers` table at startup.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_admission_wait_ms")]
    pub admission_wait_ms: u64,
    #[serde(default = "default_backend_concurrency")]
    pub per_backend_concurrency: usize,
    /// Consecutive failures before a backend is marked down.
    #[serde(default = "default_down_after")]
    pub down_after_failures: u32,
    /// Consecutive successes before a down backend is marked up.
    #[serde(default = "default_up_after")]
    pub up_after_successes: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: default_llm_model(),
            servers: Vec::new(),
            health_interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_llm_retries(),
            admission_wait_ms: default_admission_wait_ms(),
            per_backend_concurrency: default_backend_concurrency(),
            down_after_failures: default_down_after(),
            up_after_successes: default_up_after(),
        }
    }
}

fn default_llm_model() -> String {
    "llama3".to_string()
}
fn default_health_interval() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    120
}
fn default_llm_retries() -> u32 {
    2
}
fn default_admission_wait_ms() -> u64 {
    2000
}
fn default_backend_concurrency() -> usize {
    8
}
fn default_down_after() -> u32 {
    3
}
fn default_up_after() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_crawl_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
    #[serde(default)]
    pub js_render: bool,
    /// Headless-browser rendering service; used only when `js_render` is on.
    #[serde(default)]
    pub render_url: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    /// Minimum spacing between requests to one origin, in milliseconds.
    #[serde(default = "default_politeness_ms")]
    pub politeness_interval_ms: u64,
    #[serde(default = "default_crawl_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Capacity of the document-changed channel to the indexer.
    #[serde(default = "default_doc_queue")]
    pub doc_queue_depth: usize,
    /// Permit crawling private/loopback addresses (dev and intranet
    /// deployments only).
    #[serde(default)]
    pub allow_private_networks: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_crawl_concurrency(),
            page_timeout_secs: default_page_timeout(),
            js_render: false,
            render_url: None,
            max_body_bytes: default_max_body_bytes(),
            politeness_interval_ms: default_politeness_ms(),
            max_retries: default_crawl_retries(),
            user_agent: default_user_agent(),
            doc_queue_depth: default_doc_queue(),
            allow_private_networks: false,
        }
    }
}

fn default_crawl_concurrency() -> usize {
    8
}
fn default_page_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_politeness_ms() -> u64 {
    1000
}
fn default_crawl_retries() -> u32 {
    3
}
fn default_user_agent() -> String {
    concat!("answer-harness/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_doc_queue() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_read_per_min")]
    pub read_per_min: u64,
    #[serde(default = "default_write_per_min")]
    pub write_per_min: u64,
    #[serde(default = "default_per_hour")]
    pub per_hour: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_per_min: default_read_per_min(),
            write_per_min: default_write_per_min(),
            per_hour: default_per_hour(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_read_per_min() -> u64 {
    120
}
fn default_write_per_min() -> u64 {
    30
}
fn default_per_hour() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub stt_provider: String,
    #[serde(default)]
    pub stt_url: Option<String>,
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub tts_provider: String,
    #[serde(default)]
    pub tts_url: Option<String>,
    #[serde(default = "default_voice_name")]
    pub default_voice: String,
    #[serde(default = "default_history_turns")]
    pub max_history_turns: usize,
    /// Upper bound on buffered utterance audio, in bytes.
    #[serde(default = "default_audio_buffer")]
    pub max_utterance_bytes: usize,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            max_concurrent_sessions: default_max_sessions(),
            stt_provider: default_disabled(),
            stt_url: None,
            tts_provider: default_disabled(),
            tts_url: None,
            default_voice: default_voice_name(),
            max_history_turns: default_history_turns(),
            max_utterance_bytes: default_audio_buffer(),
            provider_timeout_secs: default_provider_timeout(),
        }
    }
}

fn default_session_timeout() -> u64 {
    300
}
fn default_max_sessions() -> usize {
    64
}
fn default_voice_name() -> String {
    "neutral".to_string()
}
fn default_history_turns() -> usize {
    12
}
fn default_audio_buffer() -> usize {
    2 * 1024 * 1024
}
fn default_provider_timeout() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_llm")]
    pub ttl_llm_secs: u64,
    #[serde(default = "default_ttl_embedding")]
    pub ttl_embedding_secs: u64,
    #[serde(default = "default_ttl_search")]
    pub ttl_search_secs: u64,
    #[serde(default = "default_ttl_tts")]
    pub ttl_tts_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_llm_secs: default_ttl_llm(),
            ttl_embedding_secs: default_ttl_embedding(),
            ttl_search_secs: default_ttl_search(),
            ttl_tts_secs: default_ttl_tts(),
        }
    }
}

fn default_ttl_llm() -> u64 {
    3600
}
fn default_ttl_embedding() -> u64 {
    24 * 3600
}
fn default_ttl_search() -> u64 {
    15 * 60
}
fn default_ttl_tts() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActionsConfig {
    #[serde(default = "default_action_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_action_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_action_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_action_attempts(),
            initial_backoff_secs: default_action_backoff(),
            request_timeout_secs: default_action_timeout(),
        }
    }
}

fn default_action_attempts() -> u32 {
    5
}
fn default_action_backoff() -> u64 {
    2
}
fn default_action_timeout() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// Scan period when no change events arrive.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// How long a project must be crawl-idle before indexing resumes.
    #[serde(default = "default_crawl_cooldown")]
    pub crawl_cooldown_secs: u64,
    /// Documents processed per project per cycle (oldest first).
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    /// Minimum extracted-text length to stay in the active indices.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            crawl_cooldown_secs: default_crawl_cooldown(),
            batch_limit: default_batch_limit(),
            min_text_chars: default_min_text_chars(),
        }
    }
}

fn default_scan_interval() -> u64 {
    5
}
fn default_crawl_cooldown() -> u64 {
    10
}
fn default_batch_limit() -> i64 {
    32
}
fn default_min_text_chars() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    /// Whole-prompt token budget (chars/4 estimate).
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_sentinel")]
    pub no_answer_sentinel: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_history_turns: default_history_turns(),
            no_answer_sentinel: default_sentinel(),
        }
    }
}

fn default_token_budget() -> usize {
    3500
}
fn default_sentinel() -> String {
    "I don't have that in the knowledge base.".to_string()
}

/// Load, override from the environment, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} is not a valid value: {}", name, raw)),
        None => Ok(None),
    }
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(v) = env_var("DOCUMENT_STORE_URL") {
        config.db.path = PathBuf::from(v);
    }
    if let Some(v) = env_var("EMBEDDING_MODEL") {
        config.embedding.model = Some(v);
    }
    if let Some(v) = env_var("RERANK_MODEL") {
        config.rerank.model = Some(v);
    }
    if let Some(v) = env_var("LLM_DEFAULT_MODEL") {
        config.llm.default_model = v;
    }
    if let Some(v) = parse_env::<usize>("CRAWL_MAX_CONCURRENCY")? {
        config.crawler.max_concurrency = v;
    }
    if let Some(v) = parse_env::<u64>("CRAWL_PAGE_TIMEOUT")? {
        config.crawler.page_timeout_secs = v;
    }
    if let Some(v) = parse_env::<bool>("CRAWL_JS_RENDER")? {
        config.crawler.js_render = v;
    }
    if let Some(v) = parse_env::<u64>("RATE_LIMIT_READ_PER_MIN")? {
        config.rate_limit.read_per_min = v;
    }
    if let Some(v) = parse_env::<u64>("RATE_LIMIT_WRITE_PER_MIN")? {
        config.rate_limit.write_per_min = v;
    }
    if let Some(v) = parse_env::<u64>("RATE_LIMIT_PER_HOUR")? {
        config.rate_limit.per_hour = v;
    }
    if let Some(v) = parse_env::<u64>("VOICE_SESSION_TIMEOUT")? {
        config.voice.session_timeout_secs = v;
    }
    if let Some(v) = parse_env::<usize>("VOICE_MAX_CONCURRENT_SESSIONS")? {
        config.voice.max_concurrent_sessions = v;
    }
    if let Some(v) = parse_env::<u64>("CACHE_TTL_LLM_RESULTS")? {
        config.cache.ttl_llm_secs = v;
    }
    if let Some(v) = parse_env::<u64>("CACHE_TTL_EMBEDDINGS")? {
        config.cache.ttl_embedding_secs = v;
    }
    if let Some(v) = parse_env::<u64>("CACHE_TTL_SEARCH")? {
        config.cache.ttl_search_secs = v;
    }
    if let Some(v) = env_var("ALLOWED_ORIGINS") {
        config.server.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = env_var("CSRF_SECRET_KEY") {
        config.server.csrf_secret_key = Some(v);
    }
    if let Some(v) = parse_env::<usize>("MAX_UPLOAD_SIZE")? {
        config.server.max_upload_bytes = v;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if config.retrieval.final_k < 1 {
        anyhow::bail!("retrieval.final_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.qa_match_threshold) {
        anyhow::bail!("retrieval.qa_match_threshold must be in [0.0, 1.0]");
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    match config.rerank.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.rerank.url.is_none() {
                anyhow::bail!("rerank.url must be set when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown rerank provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    for p in [&config.voice.stt_provider, &config.voice.tts_provider] {
        match p.as_str() {
            "disabled" | "http" => {}
            other => anyhow::bail!(
                "Unknown voice provider: '{}'. Must be disabled or http.",
                other
            ),
        }
    }
    if config.crawler.max_concurrency == 0 {
        anyhow::bail!("crawler.max_concurrency must be > 0");
    }
    if config.voice.max_concurrent_sessions == 0 {
        anyhow::bail!("voice.max_concurrent_sessions must be > 0");
    }
    if config.prompt.token_budget == 0 {
        anyhow::bail!("prompt.token_budget must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(toml_str)?;
        apply_env_overrides(&mut config)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.retrieval.final_k, 6);
        assert!((config.retrieval.rrf_c - 60.0).abs() < f64::EPSILON);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.rate_limit.write_per_min, 30);
        assert_eq!(config.server.max_upload_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let err = parse("[embedding]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[embedding]\nprovider = \"quantum\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_max() {
        let err = parse("[chunking]\nmax_tokens = 100\noverlap_tokens = 100\n").unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_rerank_http_requires_url() {
        let err = parse("[rerank]\nprovider = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("rerank.url"));
    }

    #[test]
    fn test_qa_threshold_bounds() {
        let err = parse("[retrieval]\nqa_match_threshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("qa_match_threshold"));
    }
}
