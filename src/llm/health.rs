//! Backend health checking with hysteresis.
//!
//! A probe loop hits every enabled backend's model list on a fixed period.
//! Request-path outcomes feed the same counters, so a backend that answers
//! probes but fails completions still goes down. Transitions require
//! `down_after_failures` consecutive failures or `up_after_successes`
//! consecutive successes, which keeps a flapping backend from oscillating.

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

use super::{client, Backend, Health, LlmCluster};

/// Record a successful probe or request against a backend.
pub(crate) async fn record_success(backend: &Arc<Backend>, config: &LlmConfig) {
    let mut state = backend.state.write().await;
    state.consecutive_failures = 0;
    state.consecutive_successes = state.consecutive_successes.saturating_add(1);
    match state.health {
        Health::Up => {}
        Health::Unknown => {
            state.health = Health::Up;
            tracing::info!(backend = %backend.id, "backend up");
        }
        Health::Down => {
            if state.consecutive_successes >= config.up_after_successes {
                state.health = Health::Up;
                tracing::info!(backend = %backend.id, "backend recovered");
            }
        }
    }
}

/// Record a failed probe or request against a backend.
pub(crate) async fn record_failure(backend: &Arc<Backend>, config: &LlmConfig) {
    let mut state = backend.state.write().await;
    state.consecutive_successes = 0;
    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
    if state.health != Health::Down && state.consecutive_failures >= config.down_after_failures {
        state.health = Health::Down;
        tracing::warn!(
            backend = %backend.id,
            failures = state.consecutive_failures,
            "backend down"
        );
    }
}

/// Probe one backend: refresh its advertised models and health counters.
pub async fn probe_backend(cluster: &LlmCluster, backend: &Arc<Backend>) {
    let timeout = Duration::from_secs(cluster.config().probe_timeout_secs);
    match client::probe_models(cluster.http(), &backend.base_url, timeout).await {
        Ok(models) => {
            {
                let mut state = backend.state.write().await;
                state.models = models.into_iter().collect();
            }
            record_success(backend, cluster.config()).await;
        }
        Err(e) => {
            tracing::debug!(backend = %backend.id, error = %e, "probe failed");
            record_failure(backend, cluster.config()).await;
        }
    }
}

/// Run the health-check loop until the cluster is dropped.
pub fn start_health_loop(cluster: Arc<LlmCluster>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(cluster.config().health_interval_secs.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            for backend in cluster.backends() {
                if backend.enabled {
                    probe_backend(&cluster, backend).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::metrics::Metrics;

    fn config() -> LlmConfig {
        LlmConfig {
            down_after_failures: 3,
            up_after_successes: 2,
            ..Default::default()
        }
    }

    fn cluster(urls: &[String]) -> LlmCluster {
        LlmCluster::from_urls(urls, config(), Cache::new(), 3600, Metrics::new())
    }

    #[tokio::test]
    async fn test_down_requires_consecutive_failures() {
        let cluster = cluster(&["http://127.0.0.1:1".to_string()]);
        let backend = &cluster.backends()[0];

        record_failure(backend, cluster.config()).await;
        record_failure(backend, cluster.config()).await;
        assert_ne!(backend.state.read().await.health, Health::Down);

        record_failure(backend, cluster.config()).await;
        assert_eq!(backend.state.read().await.health, Health::Down);
    }

    #[tokio::test]
    async fn test_success_interrupts_failure_run() {
        let cluster = cluster(&["http://127.0.0.1:1".to_string()]);
        let backend = &cluster.backends()[0];

        record_failure(backend, cluster.config()).await;
        record_failure(backend, cluster.config()).await;
        record_success(backend, cluster.config()).await;
        record_failure(backend, cluster.config()).await;
        record_failure(backend, cluster.config()).await;
        assert_ne!(
            backend.state.read().await.health,
            Health::Down,
            "interrupted run must not trip the threshold"
        );
    }

    #[tokio::test]
    async fn test_recovery_requires_consecutive_successes() {
        let cluster = cluster(&["http://127.0.0.1:1".to_string()]);
        let backend = &cluster.backends()[0];

        for _ in 0..3 {
            record_failure(backend, cluster.config()).await;
        }
        assert_eq!(backend.state.read().await.health, Health::Down);

        record_success(backend, cluster.config()).await;
        assert_eq!(backend.state.read().await.health, Health::Down);
        record_success(backend, cluster.config()).await;
        assert_eq!(backend.state.read().await.health, Health::Up);
    }

    #[tokio::test]
    async fn test_probe_refreshes_models_and_health() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/v1/models");
            then.status(200)
                .json_body(serde_json::json!({ "data": [{ "id": "llama3" }] }));
        });

        let cluster = cluster(&[server.base_url()]);
        let backend = cluster.backends()[0].clone();
        probe_backend(&cluster, &backend).await;

        let state = backend.state.read().await;
        assert_eq!(state.health, Health::Up);
        assert!(state.models.contains("llama3"));
    }
}
