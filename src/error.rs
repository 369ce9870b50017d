//! Error taxonomy shared by the HTTP surface, the workers, and the CLI.
//!
//! Transient upstream failures are retried locally (LLM failover, crawler
//! backoff, rate-limiter fail-open) and surface only after retries are
//! exhausted. Permanent errors carry the smallest faithful detail set;
//! internal messages are logged with a correlation id and never echoed to
//! end users.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Platform error kinds, observable in API responses and logs.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input; surfaced with 400 and a machine-readable field.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The requested project does not exist.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// The project exists but cannot serve requests (disabled, no prompt).
    #[error("project misconfigured: {0}")]
    ProjectMisconfigured(String),

    /// Quota exceeded; carries a Retry-After hint in seconds.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No healthy LLM backend within the admission wait.
    #[error("no backend available: {0}")]
    BackendUnavailable(String),

    /// Transient failure of an upstream dependency after local retries.
    #[error("upstream failure: {0}")]
    UpstreamTransient(String),

    /// A bounded resource is full (frontier, voice sessions, cache).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Conflicting operation (crawl already running, duplicate import).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unexpected internal error; logged with a correlation id.
    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

impl Error {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn project_not_found(slug: impl Into<String>) -> Self {
        Error::ProjectNotFound(slug.into())
    }

    pub fn misconfigured(msg: impl Into<String>) -> Self {
        Error::ProjectMisconfigured(msg.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Error::RateLimited { retry_after_secs }
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Error::BackendUnavailable(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::UpstreamTransient(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Wrap an unexpected error, logging the detail under a fresh
    /// correlation id. The detail never reaches the caller.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, error = %detail, "internal error");
        Error::Internal { correlation_id }
    }

    /// Machine-readable error code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::ProjectNotFound(_) => "project_not_found",
            Error::ProjectMisconfigured(_) => "project_misconfigured",
            Error::RateLimited { .. } => "rate_limited",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::UpstreamTransient(_) => "upstream_transient",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Conflict(_) => "conflict",
            Error::Internal { .. } => "internal",
        }
    }

    /// HTTP status code for the API surface.
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation { .. } => 400,
            Error::ProjectNotFound(_) => 404,
            Error::ProjectMisconfigured(_) => 409,
            Error::RateLimited { .. } => 429,
            Error::BackendUnavailable(_) => 503,
            Error::UpstreamTransient(_) => 502,
            Error::ResourceExhausted(_) => 503,
            Error::Conflict(_) => 409,
            Error::Internal { .. } => 500,
        }
    }

    /// Whether a local retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UpstreamTransient(_) | Error::BackendUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::internal(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::UpstreamTransient(e.to_string())
        } else {
            Error::internal(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_carries_field() {
        let err = Error::validation("max_pages", "must be positive");
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "invalid max_pages: must be positive");
    }

    #[test]
    fn test_rate_limited_hint() {
        let err = Error::rate_limited(17);
        assert_eq!(err.status(), 429);
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn test_internal_hides_detail() {
        let err = Error::internal("connection reset by peer");
        assert!(!err.to_string().contains("connection reset"));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::upstream("503 from backend").is_transient());
        assert!(!Error::conflict("crawl running").is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::project_not_found("demo").status(), 404);
        assert_eq!(Error::conflict("busy").status(), 409);
        assert_eq!(Error::backend_unavailable("none up").status(), 503);
    }
}
