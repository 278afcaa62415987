use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

/// The engine's view of the external embedding endpoint (§6): opaque `embed(text) -> vector<f32>`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> EngineResult<EmbeddingResult>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    /// False for stub/dummy providers, which drive BM25-only retrieval.
    fn is_semantic(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiEmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
    model: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

fn extract_ordered_embeddings(mut response: OpenAiEmbeddingResponse) -> EngineResult<Vec<Vec<f32>>> {
    response.data.sort_by_key(|item| item.index);
    for (expected, item) in response.data.iter().enumerate() {
        if item.index != expected {
            return Err(EngineError::EmbedFailed(format!(
                "missing or duplicated embedding index: expected {expected}, got {}",
                item.index
            )));
        }
    }
    Ok(response.data.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> EngineResult<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model: self.model.clone(),
                dimensions: self.dimensions,
            });
        }

        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = OpenAiEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".to_string(),
        };

        let send = || async {
            self.client
                .post(&endpoint)
                .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
                .header(CONTENT_TYPE, "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| EngineError::EmbedFailed(e.to_string()))?
                .error_for_status()
                .map_err(|e| EngineError::EmbedFailed(e.to_string()))
        };

        // one retry with a short backoff, per the external-callable failure policy
        let response = match send().await {
            Ok(r) => r,
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                send().await?
            }
        };

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngineError::EmbedFailed(e.to_string()))?;
        let model = parsed.model.clone();
        let embeddings = extract_ordered_embeddings(parsed)?;

        if embeddings.len() != texts.len() {
            return Err(EngineError::EmbedFailed(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimensions) {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> EngineResult<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| (0..self.dims).map(|i| Self::hash_to_unit_range(text, i)).collect())
            .collect();
        Ok(EmbeddingResult {
            embeddings,
            model: "stub".to_string(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

pub fn compute_text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    result[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot as f64) / (norm_a as f64 * norm_b as f64)
}

/// Mean pairwise cosine similarity across a set of vectors (§4.G's centrality helper).
/// Used as an `importance_score` fallback for messages whose score is still at the
/// schema default — central vectors (similar to their own neighborhood) score higher.
pub fn mean_pairwise_cosine_similarity(vectors: &[Vec<f32>]) -> f64 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            total += cosine_similarity(&vectors[i], &vectors[j]);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

impl Store {
    pub async fn get_embedding_cache(&self, model_id: &str, hash: &str) -> EngineResult<Option<Vec<f32>>> {
        let db = self.conn();
        let model_id = model_id.to_string();
        let hash = hash.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut lookup = conn
                .prepare_cached("SELECT vector FROM embedding_cache WHERE content_hash = ?1 AND model_id = ?2")
                .map_err(EngineError::from)?;
            let bytes: Option<Vec<u8>> = lookup.query_row(params![hash, model_id], |r| r.get(0)).ok();
            drop(lookup);
            if bytes.is_some() {
                let mut touch = conn
                    .prepare_cached(
                        "UPDATE embedding_cache SET last_accessed_at = ?1 WHERE content_hash = ?2 AND model_id = ?3",
                    )
                    .map_err(EngineError::from)?;
                touch
                    .execute(params![Utc::now().to_rfc3339(), hash, model_id])
                    .map_err(EngineError::from)?;
            }
            Ok(bytes.map(|b| bytes_to_vector(&b)))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn set_embedding_cache(&self, model_id: &str, hash: &str, vector: &[f32]) -> EngineResult<()> {
        let db = self.conn();
        let model_id = model_id.to_string();
        let hash = hash.to_string();
        let bytes = vector_to_bytes(vector);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO embedding_cache (content_hash, model_id, vector, created_at, last_accessed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(content_hash) DO UPDATE SET vector = excluded.vector, last_accessed_at = excluded.last_accessed_at",
                params![hash, model_id, bytes, now],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Evicts the least-recently-accessed cache rows beyond `max_entries`.
    pub async fn evict_embedding_cache(&self, max_entries: i64) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let deleted = conn
                .execute(
                    "DELETE FROM embedding_cache WHERE content_hash IN ( \
                        SELECT content_hash FROM embedding_cache ORDER BY last_accessed_at DESC \
                        LIMIT -1 OFFSET ?1)",
                    [max_entries],
                )
                .map_err(EngineError::from)?;
            Ok(deleted as i64)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Adds (or replaces) a message's vector in the `vec0` ANN table, realizing §4.B's opaque ANN index.
    pub async fn ann_add(&self, message_id: i64, vector: &[f32], model_id: &str) -> EngineResult<()> {
        let expected = crate::migrations::vector_dim();
        if vector.len() != expected {
            return Err(EngineError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        let db = self.conn();
        let bytes = vector_to_bytes(vector);
        let model_id = model_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "INSERT INTO message_embeddings (message_id, model_id, created_at, vector) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(message_id) DO UPDATE SET vector = excluded.vector, model_id = excluded.model_id",
                params![message_id, model_id, Utc::now().to_rfc3339(), bytes],
            )
            .map_err(EngineError::from)?;
            conn.execute(
                "INSERT INTO message_vectors (message_id, embedding) VALUES (?1, ?2) \
                 ON CONFLICT(message_id) DO UPDATE SET embedding = excluded.embedding",
                params![message_id, bytes],
            )
            .map_err(|e| EngineError::AnnFailed(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// KNN search over the vec0 table; returns `(message_id, cosine_distance)` pairs.
    pub async fn ann_search(&self, query_vector: &[f32], k: i64) -> EngineResult<Vec<(i64, f64)>> {
        let expected = crate::migrations::vector_dim();
        if query_vector.len() != expected {
            return Err(EngineError::DimensionMismatch {
                expected,
                actual: query_vector.len(),
            });
        }
        let db = self.conn();
        let bytes = vector_to_bytes(query_vector);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, distance FROM message_vectors \
                     WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
                )
                .map_err(|e| EngineError::AnnFailed(e.to_string()))?;
            let rows = stmt
                .query_map(params![bytes, k], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(|e| EngineError::AnnFailed(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| EngineError::AnnFailed(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Fetches a single message's stored vector, if it has been indexed.
    pub async fn get_embedding_vector(&self, message_id: i64) -> EngineResult<Option<Vec<f32>>> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT vector FROM message_embeddings WHERE message_id = ?1",
                    [message_id],
                    |r| r.get(0),
                )
                .ok();
            Ok(bytes.map(|b| bytes_to_vector(&b)))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Updates a message's `importance_score`, e.g. from the centrality fallback.
    pub async fn set_importance_score(&self, message_id: i64, score: f64) -> EngineResult<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE messages SET importance_score = ?1 WHERE id = ?2",
                params![score, message_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Full scan rebuild of the vec0 table from `message_embeddings`, never re-embedding.
    pub async fn ann_rebuild(&self) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute("DELETE FROM message_vectors", [])
                .map_err(|e| EngineError::AnnFailed(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT message_id, vector FROM message_embeddings")
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)))
                .map_err(EngineError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(EngineError::from)?;
            let count = rows.len() as i64;
            for (message_id, vector) in rows {
                conn.execute(
                    "INSERT INTO message_vectors (message_id, embedding) VALUES (?1, ?2)",
                    params![message_id, vector],
                )
                .map_err(|e| EngineError::AnnFailed(e.to_string()))?;
            }
            Ok(count)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

/// Wraps any provider with the content-hash cache of §4.B.
pub struct CachedEmbeddingProvider<P: EmbeddingProvider> {
    inner: P,
    store: Arc<Store>,
}

impl<P: EmbeddingProvider> CachedEmbeddingProvider<P> {
    pub fn new(inner: P, store: Arc<Store>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl<P: EmbeddingProvider + 'static> EmbeddingProvider for CachedEmbeddingProvider<P> {
    async fn embed(&self, texts: &[String]) -> EngineResult<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model: self.inner.model_id().to_string(),
                dimensions: self.inner.dimensions(),
            });
        }

        let model = self.inner.model_id().to_string();
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut uncached_indices = Vec::new();
        let mut uncached_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let hash = compute_text_hash(text);
            match self.store.get_embedding_cache(&model, &hash).await {
                Ok(Some(vector)) => results.push(Some(vector)),
                _ => {
                    results.push(None);
                    uncached_indices.push(i);
                    uncached_texts.push(text.clone());
                }
            }
        }

        if !uncached_texts.is_empty() {
            let fresh = self.inner.embed(&uncached_texts).await?;
            for (idx, (text, vector)) in uncached_indices.iter().zip(uncached_texts.iter().zip(fresh.embeddings.iter())) {
                let hash = compute_text_hash(text);
                let _ = self.store.set_embedding_cache(&model, &hash, vector).await;
                results[*idx] = Some(vector.clone());
            }
        }

        let embeddings = results
            .into_iter()
            .map(|r| r.expect("every text has a cached or freshly computed embedding"))
            .collect();

        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions: self.inner.dimensions(),
        })
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn is_semantic(&self) -> bool {
        self.inner.is_semantic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_is_deterministic_and_non_semantic() {
        let provider = StubEmbeddingProvider::new(8);
        let a = provider.embed(&["hello".to_string()]).await.unwrap();
        let b = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a.embeddings, b.embeddings);
        assert!(!provider.is_semantic());
    }

    #[tokio::test]
    async fn embedding_cache_roundtrips_through_store() {
        let store = Store::open_in_memory().unwrap();
        let vec = vec![0.1f32, 0.2, 0.3];
        store.set_embedding_cache("stub", "hash1", &vec).await.unwrap();
        let fetched = store.get_embedding_cache("stub", "hash1").await.unwrap().unwrap();
        assert_eq!(fetched, vec);
    }

    #[tokio::test]
    async fn cached_provider_hits_cache_on_second_call() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cached = CachedEmbeddingProvider::new(StubEmbeddingProvider::new(4), store);
        let first = cached.embed(&["repeat me".to_string()]).await.unwrap();
        let second = cached.embed(&["repeat me".to_string()]).await.unwrap();
        assert_eq!(first.embeddings, second.embeddings);
    }
}
