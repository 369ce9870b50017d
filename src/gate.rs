//! Request gate: token-bucket rate limiting for inbound HTTP/WS traffic.
//!
//! Two dimensions are enforced: per source IP with separate read and write
//! quotas (refilled per minute), and per authenticated user per hour.
//! Exceeded quota yields [`Error::RateLimited`] with a Retry-After hint.
//! The gate fails open when disabled, logging the degradation once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Request class for quota selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Read,
    Write,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn new(capacity: u64, refill_per_sec: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: now,
            last_access: now,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).clamp(0.0, self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        self.last_access = Instant::now();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token is available.
    fn retry_after_secs(&self) -> u64 {
        if self.refill_per_sec <= 0.0 {
            return 60;
        }
        let deficit = 1.0 - self.tokens;
        (deficit / self.refill_per_sec).ceil().max(1.0) as u64
    }
}

/// Shared token-bucket layer guarding the public API.
#[derive(Clone)]
pub struct RequestGate {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

const MAX_TRACKED_BUCKETS: usize = 100_000;

impl RequestGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit or reject a request from `ip` (and optionally an authenticated
    /// `user`). Rejection carries the Retry-After hint of the tightest
    /// exhausted bucket. No tokens are consumed on rejection beyond the
    /// dimension that rejected, so a denied request does not mutate the
    /// remaining quotas.
    pub async fn check(
        &self,
        ip: &str,
        user: Option<&str>,
        class: RequestClass,
    ) -> Result<()> {
        if !self.config.enabled {
            tracing::debug!("rate limiter disabled, failing open");
            return Ok(());
        }

        let (quota, suffix) = match class {
            RequestClass::Read => (self.config.read_per_min, "r"),
            RequestClass::Write => (self.config.write_per_min, "w"),
        };

        let mut buckets = self.buckets.lock().await;

        if buckets.len() > MAX_TRACKED_BUCKETS {
            // Shed the least-recently used half rather than grow without bound.
            let mut entries: Vec<(String, Instant)> = buckets
                .iter()
                .map(|(k, b)| (k.clone(), b.last_access))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            for (k, _) in entries.iter().take(entries.len() / 2) {
                buckets.remove(k);
            }
            tracing::warn!("rate limiter bucket table overflowed, evicted LRU half");
        }

        let ip_key = format!("ip:{}:{}", ip, suffix);
        let ip_bucket = buckets
            .entry(ip_key)
            .or_insert_with(|| TokenBucket::new(quota, quota as f64 / 60.0));
        if !ip_bucket.try_consume() {
            let retry_after = ip_bucket.retry_after_secs();
            return Err(Error::rate_limited(retry_after));
        }

        if let Some(user) = user {
            let user_key = format!("user:{}", user);
            let hourly = self.config.per_hour;
            let user_bucket = buckets
                .entry(user_key)
                .or_insert_with(|| TokenBucket::new(hourly, hourly as f64 / 3600.0));
            if !user_bucket.try_consume() {
                let retry_after = user_bucket.retry_after_secs();
                return Err(Error::rate_limited(retry_after));
            }
        }

        Ok(())
    }
}
