//! Hybrid retrieval: QA short-circuit, dense ∥ lexical fan-out, reciprocal
//! rank fusion, deduplication, best-effort reranking, and result caching.
//!
//! # Fusion
//!
//! Dense and lexical candidate lists are merged with RRF: each chunk scores
//! `Σ 1/(C + rank_i)` over the lists it appears in (1-based ranks,
//! C = `retrieval.rrf_c`). Ties break by raw lexical score, then by
//! document priority. Duplicate chunk text across documents keeps the
//! highest-scored occurrence.
//!
//! # Degradation
//!
//! With the embedding provider down or disabled, retrieval proceeds
//! lexical-only and flags the result `degraded`. A reranker failure is
//! logged and the fused ordering stands. The retriever never raises for
//! these conditions.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::config::{CacheConfig, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::Result;
use crate::index::{self, Candidate};
use crate::models::{RetrievalResult, SearchHit};
use crate::qa;
use crate::rerank::Reranker;

/// Score assigned to a QA short-circuit hit; above anything fusion or the
/// reranker can produce.
const QA_SCORE: f64 = 1000.0;

pub struct Retriever {
    pool: SqlitePool,
    config: RetrievalConfig,
    cache_config: CacheConfig,
    cache: Cache,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    /// Hash of the retrieval tuning; part of every result cache key so a
    /// config change cannot serve stale rankings.
    config_hash: String,
}

impl Retriever {
    pub fn new(
        pool: SqlitePool,
        config: RetrievalConfig,
        cache_config: CacheConfig,
        cache: Cache,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        let config_hash = {
            let mut hasher = Sha256::new();
            hasher.update(format!(
                "{}|{}|{}|{}|{}|{}",
                config.candidate_multiplier,
                config.rrf_c,
                config.final_k,
                config.qa_match_threshold,
                config.rerank_multiplier,
                embedder.model_name(),
            ));
            format!("{:x}", hasher.finalize())[..16].to_string()
        };
        Self {
            pool,
            config,
            cache_config,
            cache,
            embedder,
            reranker,
            config_hash,
        }
    }

    /// Drop cached results for a project after its indices are rebuilt.
    pub async fn invalidate_project(&self, project: &str) {
        self.cache.invalidate("retrieval", project).await;
    }

    /// The platform's retrieval entry point.
    pub async fn hybrid_search(
        &self,
        project: &str,
        query: &str,
        k: i64,
    ) -> Result<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(RetrievalResult {
                hits: Vec::new(),
                degraded: false,
            });
        }
        let k = if k < 1 { self.config.final_k } else { k };

        let cache_key = self.result_cache_key(project, query, k);
        if let Some(bytes) = self.cache.get(&cache_key).await {
            if let Ok(result) = serde_json::from_slice::<RetrievalResult>(&bytes) {
                return Ok(result);
            }
        }

        // 1. Exact QA short-circuit.
        if let Some(pair) = qa::find_exact(&self.pool, project, query).await? {
            let result = qa_result(&pair);
            self.store_result(&cache_key, &result).await;
            return Ok(result);
        }

        // 2. Query embedding, once; failure degrades to lexical-only.
        let mut degraded = false;
        let query_vec = if self.embedder.dims() > 0 {
            match self.embed_query_cached(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(project, error = %e, "query embedding failed, lexical-only");
                    degraded = true;
                    None
                }
            }
        } else {
            degraded = true;
            None
        };

        // 3. Semantic QA short-circuit.
        if let Some(ref vec) = query_vec {
            if let Some((pair, similarity)) = qa::find_semantic(&self.pool, project, vec).await? {
                if similarity >= self.config.qa_match_threshold {
                    let result = qa_result(&pair);
                    self.store_result(&cache_key, &result).await;
                    return Ok(result);
                }
            }
        }

        // 4. Fan out to both indices in parallel.
        let candidate_k = self.config.candidate_multiplier * k;
        let (dense, lexical) = match query_vec {
            Some(ref vec) => {
                let (dense_result, lexical_result) = tokio::join!(
                    index::dense_candidates(&self.pool, project, vec, candidate_k),
                    index::lexical_candidates(&self.pool, project, query, candidate_k),
                );
                let dense = match dense_result {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(project, error = %e, "dense search failed, lexical-only");
                        degraded = true;
                        Vec::new()
                    }
                };
                (dense, lexical_result?)
            }
            None => (
                Vec::new(),
                index::lexical_candidates(&self.pool, project, query, candidate_k).await?,
            ),
        };

        if dense.is_empty() && lexical.is_empty() {
            let result = RetrievalResult {
                hits: Vec::new(),
                degraded,
            };
            self.store_result(&cache_key, &result).await;
            return Ok(result);
        }

        // 5. Fuse, tie-break, dedup.
        let priorities = self
            .document_priorities(dense.iter().chain(lexical.iter()))
            .await?;
        let mut fused = rrf_fuse(&dense, &lexical, self.config.rrf_c, &priorities);
        dedup_by_text_hash(&mut fused);

        // 6. Best-effort rerank of the head of the fused list.
        let rerank_k = (self.config.rerank_multiplier * k) as usize;
        if let Some(ref reranker) = self.reranker {
            let pool_size = fused.len().min(rerank_k);
            if pool_size > 1 {
                let texts: Vec<String> = fused[..pool_size]
                    .iter()
                    .map(|f| f.candidate.excerpt.clone())
                    .collect();
                match reranker.rerank(query, &texts).await {
                    Ok(scores) => {
                        for (f, score) in fused[..pool_size].iter_mut().zip(scores.iter()) {
                            f.score = *score as f64;
                        }
                        fused[..pool_size].sort_by(|a, b| {
                            b.score
                                .partial_cmp(&a.score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    }
                    Err(e) => {
                        tracing::warn!(project, error = %e, "rerank failed, using fused order");
                    }
                }
            }
        }

        fused.truncate(k as usize);

        // 7. Attach document metadata for citation.
        let hits = self.attach_metadata(fused).await?;
        let result = RetrievalResult { hits, degraded };
        self.store_result(&cache_key, &result).await;
        Ok(result)
    }

    fn result_cache_key(&self, project: &str, query: &str, k: i64) -> String {
        let normalized = qa::normalize_question(query);
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}", normalized, k, self.config_hash));
        Cache::key(
            "retrieval",
            project,
            &format!("{:x}", hasher.finalize())[..32].to_string(),
        )
    }

    async fn store_result(&self, key: &str, result: &RetrievalResult) {
        if let Ok(bytes) = serde_json::to_vec(result) {
            self.cache
                .put(
                    key.to_string(),
                    bytes,
                    Duration::from_secs(self.cache_config.ttl_search_secs),
                )
                .await;
        }
    }

    async fn embed_query_cached(&self, query: &str) -> Result<Vec<f32>> {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}", self.embedder.model_name(), query));
        let key = Cache::key(
            "embedding",
            "",
            &format!("{:x}", hasher.finalize())[..32].to_string(),
        );

        if let Some(bytes) = self.cache.get(&key).await {
            return Ok(embedding::blob_to_vec(&bytes));
        }
        let vec = embedding::embed_query(self.embedder.as_ref(), query).await?;
        self.cache
            .put(
                key,
                embedding::vec_to_blob(&vec),
                Duration::from_secs(self.cache_config.ttl_embedding_secs),
            )
            .await;
        Ok(vec)
    }

    async fn document_priorities<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Candidate>,
    ) -> Result<HashMap<String, f64>> {
        let mut ids: Vec<&str> = candidates.map(|c| c.document_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut priorities = HashMap::new();
        for id in ids {
            let priority: Option<f64> =
                sqlx::query_scalar("SELECT priority FROM documents WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            priorities.insert(id.to_string(), priority.unwrap_or(0.0));
        }
        Ok(priorities)
    }

    async fn attach_metadata(&self, fused: Vec<Fused>) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::with_capacity(fused.len());
        for f in fused {
            let row = sqlx::query("SELECT source_url, title FROM documents WHERE id = ?")
                .bind(&f.candidate.document_id)
                .fetch_optional(&self.pool)
                .await?;
            let (source_url, title) = match row {
                Some(r) => (r.get("source_url"), r.get("title")),
                None => (None, None),
            };
            hits.push(SearchHit {
                chunk_id: f.candidate.chunk_id,
                document_id: f.candidate.document_id,
                source_url,
                title,
                excerpt: f.candidate.excerpt,
                score: f.score,
            });
        }
        Ok(hits)
    }
}

fn qa_result(pair: &crate::models::QaPair) -> RetrievalResult {
    RetrievalResult {
        hits: vec![SearchHit {
            chunk_id: format!("qa:{}", pair.id),
            document_id: format!("qa:{}", pair.id),
            source_url: None,
            title: Some(pair.question.clone()),
            excerpt: pair.answer.clone(),
            score: QA_SCORE,
        }],
        degraded: false,
    }
}

/// A candidate with its fused score and tie-break keys.
struct Fused {
    candidate: Candidate,
    score: f64,
    lexical_score: f64,
    priority: f64,
}

/// Reciprocal rank fusion over the two candidate lists.
fn rrf_fuse(
    dense: &[Candidate],
    lexical: &[Candidate],
    c: f64,
    priorities: &HashMap<String, f64>,
) -> Vec<Fused> {
    let mut by_chunk: HashMap<&str, Fused> = HashMap::new();

    for (rank, cand) in dense.iter().enumerate() {
        let rrf = 1.0 / (c + (rank + 1) as f64);
        by_chunk
            .entry(cand.chunk_id.as_str())
            .and_modify(|f| f.score += rrf)
            .or_insert_with(|| Fused {
                candidate: cand.clone(),
                score: rrf,
                lexical_score: 0.0,
                priority: priorities
                    .get(&cand.document_id)
                    .copied()
                    .unwrap_or(0.0),
            });
    }

    for (rank, cand) in lexical.iter().enumerate() {
        let rrf = 1.0 / (c + (rank + 1) as f64);
        match by_chunk.get_mut(cand.chunk_id.as_str()) {
            Some(f) => {
                f.score += rrf;
                f.lexical_score = cand.raw_score;
            }
            None => {
                by_chunk.insert(
                    cand.chunk_id.as_str(),
                    Fused {
                        candidate: cand.clone(),
                        score: rrf,
                        lexical_score: cand.raw_score,
                        priority: priorities
                            .get(&cand.document_id)
                            .copied()
                            .unwrap_or(0.0),
                    },
                );
            }
        }
    }

    let mut fused: Vec<Fused> = by_chunk.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.lexical_score
                    .partial_cmp(&a.lexical_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                b.priority
                    .partial_cmp(&a.priority)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.candidate.chunk_id.cmp(&b.candidate.chunk_id))
    });
    fused
}

/// Keep the highest-scored occurrence of each chunk text. The input must
/// already be sorted by descending score.
fn dedup_by_text_hash(fused: &mut Vec<Fused>) {
    let mut seen = std::collections::HashSet::new();
    fused.retain(|f| seen.insert(f.candidate.text_hash.clone()));
}
