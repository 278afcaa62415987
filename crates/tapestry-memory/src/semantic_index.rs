use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio::task;

use crate::embedding::{mean_pairwise_cosine_similarity, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// `Message::importance_score`'s schema default; treated as "unset" for the
/// centrality fallback so an explicitly-scored message is never overwritten.
const IMPORTANCE_SCORE_DEFAULT: f64 = 0.5;
const CENTRALITY_NEIGHBORHOOD: i64 = 10;

/// Three consecutive tick failures open the circuit; each subsequent failure
/// doubles the cooldown, capped at this ceiling.
const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 3;
const CIRCUIT_BREAKER_BASE_COOLDOWN_MS: u64 = 1_000;
const CIRCUIT_BREAKER_MAX_COOLDOWN_MS: u64 = 300_000;

pub struct SemanticIndexService<P: EmbeddingProvider> {
    store: Arc<Store>,
    provider: Arc<P>,
    batch_size: usize,
}

impl<P: EmbeddingProvider + 'static> SemanticIndexService<P> {
    pub fn new(store: Arc<Store>, provider: Arc<P>, batch_size: usize) -> Self {
        Self {
            store,
            provider,
            batch_size,
        }
    }

    /// Embeds and indexes one message immediately.
    pub async fn index_message(&self, message_id: i64) -> EngineResult<()> {
        let msg = self.store.get_message(message_id).await?;
        if msg.is_summarized || msg.content.is_empty() {
            return Ok(());
        }
        let result = self.provider.embed(&[msg.content.clone()]).await?;
        let vector = result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::EmbedFailed("embedding provider returned no vectors".into()))?;
        self.store.ann_add(message_id, &vector, &result.model).await?;

        if msg.importance_score == IMPORTANCE_SCORE_DEFAULT {
            if let Ok(centrality) = self.centrality_score(message_id, &vector).await {
                self.store.set_importance_score(message_id, centrality).await?;
            }
        }
        Ok(())
    }

    /// Mean pairwise cosine similarity between `vector` and its nearest indexed
    /// neighbors; a fallback `importance_score` for messages that never received
    /// an explicit one.
    async fn centrality_score(&self, message_id: i64, vector: &[f32]) -> EngineResult<f64> {
        let hits = self.store.ann_search(vector, CENTRALITY_NEIGHBORHOOD + 1).await?;
        let mut neighborhood = vec![vector.to_vec()];
        for (neighbor_id, _distance) in hits {
            if neighbor_id == message_id {
                continue;
            }
            if let Some(neighbor_vector) = self.store.get_embedding_vector(neighbor_id).await? {
                neighborhood.push(neighbor_vector);
            }
        }
        Ok(mean_pairwise_cosine_similarity(&neighborhood))
    }

    /// Finds unindexed, non-summarized, non-empty messages and embeds a batch of them.
    pub async fn index_pending(&self) -> EngineResult<usize> {
        let ids = self.pending_message_ids().await?;
        let mut indexed = 0;
        for id in ids {
            if let Err(e) = self.index_message(id).await {
                tracing::warn!(message_id = id, error = %e, "failed to index message");
                continue;
            }
            indexed += 1;
        }
        Ok(indexed)
    }

    async fn pending_message_ids(&self) -> EngineResult<Vec<i64>> {
        let db = self.store.conn();
        let limit = self.batch_size as i64;
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT m.id FROM messages m LEFT JOIN message_embeddings e ON e.message_id = m.id \
                     WHERE e.message_id IS NULL AND m.is_summarized = 0 AND m.content != '' \
                     ORDER BY m.created_at DESC LIMIT ?1",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![limit], |r| r.get::<_, i64>(0))
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Similarity search over indexed messages; embeds the query through the same provider.
    pub async fn search(&self, query: &str, k: i64) -> EngineResult<Vec<(i64, f64)>> {
        let result = self.provider.embed(&[query.to_string()]).await?;
        let vector = result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::EmbedFailed("embedding provider returned no vectors".into()))?;
        self.store.ann_search(&vector, k).await
    }

    /// Runs `index_pending` on a fixed interval until `stop` fires. Three
    /// consecutive failed ticks open a local circuit breaker that skips ticks
    /// for an exponentially growing cooldown before trying again.
    pub async fn run_background(self: Arc<Self>, interval_ms: u64, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut consecutive_failures: u32 = 0;
        let mut cooldown_until: Option<tokio::time::Instant> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(until) = cooldown_until {
                        if tokio::time::Instant::now() < until {
                            tracing::warn!("semantic index circuit open, skipping tick");
                            continue;
                        }
                        cooldown_until = None;
                    }
                    match self.index_pending().await {
                        Ok(n) if n > 0 => {
                            consecutive_failures = 0;
                            tracing::info!(indexed = n, "semantic index batch complete");
                        }
                        Ok(_) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            tracing::warn!(error = %e, consecutive_failures, "semantic index tick failed");
                            if consecutive_failures >= CIRCUIT_BREAKER_FAILURE_THRESHOLD {
                                let cooldown_ms = circuit_breaker_cooldown_ms(consecutive_failures);
                                tracing::warn!(cooldown_ms, "semantic index circuit breaker tripped");
                                cooldown_until = Some(tokio::time::Instant::now() + Duration::from_millis(cooldown_ms));
                            }
                        }
                    }
                }
                _ = &mut stop => {
                    tracing::info!("semantic index background loop stopping");
                    break;
                }
            }
        }
    }
}

/// Exponential cooldown once the breaker trips: doubles per failure beyond the
/// threshold, capped at `CIRCUIT_BREAKER_MAX_COOLDOWN_MS`.
fn circuit_breaker_cooldown_ms(consecutive_failures: u32) -> u64 {
    let doublings = consecutive_failures - CIRCUIT_BREAKER_FAILURE_THRESHOLD;
    CIRCUIT_BREAKER_BASE_COOLDOWN_MS
        .saturating_mul(1u64 << doublings.min(20))
        .min(CIRCUIT_BREAKER_MAX_COOLDOWN_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubEmbeddingProvider;
    use chrono::Utc;
    use tapestry_schema::{Conversation, MemoryTier, Message, MessageRole, Session, SessionStatus};

    async fn store_with_message(content: &str) -> (Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        store
            .create_session(Session {
                session_id: "s1".into(),
                user_id: "u1".into(),
                project_id: None,
                status: SessionStatus::Active,
                created_at: now,
                last_active_at: now,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let conv_id = store
            .create_conversation(Conversation {
                id: 0,
                session_id: "s1".into(),
                title: None,
                started_at: now,
                ended_at: None,
                message_count: 0,
                summary: None,
            })
            .await
            .unwrap();
        let id = store
            .insert_message(Message {
                id: 0,
                conversation_id: conv_id,
                role: MessageRole::User,
                content: content.to_string(),
                token_count: None,
                created_at: now,
                importance_score: 0.5,
                is_summarized: false,
                original_content: None,
                tier: MemoryTier::Conversation,
                agent_id: None,
                reference_count: 0,
                promotion_count: 0,
                tier_promoted_at: None,
                last_referenced_at: now,
                source_agent_id: None,
                shared_with_agents: Default::default(),
                handoff_id: None,
            })
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn index_pending_embeds_unindexed_messages() {
        let (store, id) = store_with_message("hello there").await;
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let service = SemanticIndexService::new(store.clone(), provider, 10);
        let indexed = service.index_pending().await.unwrap();
        assert_eq!(indexed, 1);
        let results = service.search("hello there", 5).await.unwrap();
        assert!(results.iter().any(|(mid, _)| *mid == id));
    }

    #[tokio::test]
    async fn rebuild_restores_vector_table_from_embeddings() {
        let (store, _id) = store_with_message("a message about rust").await;
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let service = SemanticIndexService::new(store.clone(), provider, 10);
        service.index_pending().await.unwrap();
        let rebuilt = store.ann_rebuild().await.unwrap();
        assert_eq!(rebuilt, 1);
    }

    #[tokio::test]
    async fn indexing_fills_in_a_default_importance_score_from_centrality() {
        let (store, id) = store_with_message("a message about rust").await;
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let service = SemanticIndexService::new(store.clone(), provider, 10);
        service.index_message(id).await.unwrap();
        let msg = store.get_message(id).await.unwrap();
        assert!(msg.importance_score.is_finite());
    }

    #[test]
    fn circuit_breaker_cooldown_grows_and_caps() {
        let first = circuit_breaker_cooldown_ms(CIRCUIT_BREAKER_FAILURE_THRESHOLD);
        let second = circuit_breaker_cooldown_ms(CIRCUIT_BREAKER_FAILURE_THRESHOLD + 1);
        assert!(second > first);
        assert!(circuit_breaker_cooldown_ms(200) <= CIRCUIT_BREAKER_MAX_COOLDOWN_MS);
    }
}
