//! Cross-encoder reranking provider.
//!
//! Best-effort by design: a rerank failure logs and leaves the fused
//! ordering in place. The HTTP provider posts (query, documents) batches to
//! a rerank endpoint and accepts either a bare `scores` array or the
//! `results: [{index, relevance_score}]` shape common to hosted rerankers.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::RerankConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each document against the query; higher is more relevant.
    /// Returns one score per input document, in input order.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

pub fn create_reranker(config: &RerankConfig) -> anyhow::Result<Option<Box<dyn Reranker>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Box::new(HttpReranker::new(config)?))),
        other => anyhow::bail!("Unknown rerank provider: {}", other),
    }
}

pub struct HttpReranker {
    url: String,
    model: Option<String>,
    client: reqwest::Client,
    batch_size: usize,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url,
            model: config.model.clone(),
            client,
            batch_size: config.batch_size.max(1),
        })
    }

    async fn rerank_batch(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let mut body = serde_json::json!({ "query": query, "documents": documents });
        if let Some(ref model) = self.model {
            body["model"] = serde_json::json!(model);
        }

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(format!("rerank API error {}", status)));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("invalid rerank response: {}", e)))?;

        parse_scores(&json, documents.len())
    }
}

fn parse_scores(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    if let Some(scores) = json.get("scores").and_then(|s| s.as_array()) {
        let parsed: Vec<f32> = scores
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if parsed.len() == expected {
            return Ok(parsed);
        }
        return Err(Error::upstream("rerank score count mismatch"));
    }

    if let Some(results) = json.get("results").and_then(|r| r.as_array()) {
        let mut scores = vec![0.0f32; expected];
        for item in results {
            let index = item.get("index").and_then(|i| i.as_u64()).map(|i| i as usize);
            let score = item
                .get("relevance_score")
                .or_else(|| item.get("score"))
                .and_then(|s| s.as_f64());
            if let (Some(i), Some(s)) = (index, score) {
                if i < expected {
                    scores[i] = s as f32;
                }
            }
        }
        return Ok(scores);
    }

    Err(Error::upstream("unrecognized rerank response shape"))
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let mut all = Vec::with_capacity(documents.len());
        for batch in documents.chunks(self.batch_size) {
            all.extend(self.rerank_batch(query, batch).await?);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(url: &str) -> RerankConfig {
        RerankConfig {
            provider: "http".into(),
            model: Some("cross-encoder".into()),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_bare_scores() {
        let json = serde_json::json!({ "scores": [0.9, 0.1, 0.5] });
        let scores = parse_scores(&json, 3).unwrap();
        assert_eq!(scores, vec![0.9, 0.1, 0.5]);
    }

    #[test]
    fn test_parse_indexed_results() {
        let json = serde_json::json!({
            "results": [
                { "index": 1, "relevance_score": 0.8 },
                { "index": 0, "relevance_score": 0.2 }
            ]
        });
        let scores = parse_scores(&json, 2).unwrap();
        assert_eq!(scores, vec![0.2, 0.8]);
    }

    #[test]
    fn test_parse_rejects_mismatch() {
        let json = serde_json::json!({ "scores": [0.9] });
        assert!(parse_scores(&json, 2).is_err());
    }

    #[tokio::test]
    async fn test_http_reranker_roundtrip() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/rerank");
            then.status(200)
                .json_body(serde_json::json!({ "scores": [0.3, 0.7] }));
        });

        let reranker = HttpReranker::new(&http_config(&server.url("/rerank"))).unwrap();
        let scores = reranker
            .rerank("query", &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.3, 0.7]);
    }

    #[tokio::test]
    async fn test_http_reranker_error_is_transient() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/rerank");
            then.status(503);
        });

        let reranker = HttpReranker::new(&http_config(&server.url("/rerank"))).unwrap();
        let err = reranker.rerank("q", &["a".into()]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
