//! Per-origin politeness throttle.
//!
//! A refilling single-token bucket per origin enforces a minimum spacing
//! between requests to the same host, independent of how many crawl
//! workers are running. Workers await their turn before fetching.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct OriginThrottle {
    interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl OriginThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next request slot for `origin`, sleeping until it
    /// opens. Reservation happens under the lock, so concurrent workers
    /// serialize per origin without holding the lock while sleeping.
    pub async fn wait_turn(&self, origin: &str) {
        let reserved = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(origin).copied().unwrap_or(now).max(now);
            slots.insert(origin.to_string(), slot + self.interval);
            slot
        };

        let now = Instant::now();
        if reserved > now {
            tokio::time::sleep(reserved - now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_origin_requests_are_spaced() {
        let throttle = OriginThrottle::new(Duration::from_millis(50));
        let start = Instant::now();
        throttle.wait_turn("https://a.test").await;
        throttle.wait_turn("https://a.test").await;
        throttle.wait_turn("https://a.test").await;
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "three requests need two full intervals"
        );
    }

    #[tokio::test]
    async fn test_distinct_origins_do_not_wait() {
        let throttle = OriginThrottle::new(Duration::from_millis(200));
        let start = Instant::now();
        throttle.wait_turn("https://a.test").await;
        throttle.wait_turn("https://b.test").await;
        throttle.wait_turn("https://c.test").await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_concurrent_workers_serialize_per_origin() {
        let throttle = std::sync::Arc::new(OriginThrottle::new(Duration::from_millis(40)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = throttle.clone();
            handles.push(tokio::spawn(async move {
                t.wait_turn("https://a.test").await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(120));
    }
}
