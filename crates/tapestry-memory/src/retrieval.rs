use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tapestry_schema::{MemoryTier, Message, MessageRole, RetrievalConfig, RetrievalContext, RetrievalMode, ScoreWeights, ScoredSource};
use tokio::sync::Mutex as AsyncMutex;

use crate::embedding::EmbeddingProvider;
use crate::entities::extract_from_text;
use crate::store::Store;
use tapestry_schema::InjectionResult;

const KNOWN_QUERY_FIELDS: &[&str] = &["description", "prompt", "task", "query", "message", "input", "objective"];
const RECENCY_HALF_LIFE_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;
const LATENCY_SAMPLE_CAP: usize = 100;

pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() as i64 + 3) / 4
}

#[derive(Clone)]
struct CacheEntry {
    result: InjectionResult,
    cached_at: Instant,
}

/// p50/p95/p99 over a ring buffer of latency samples, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

fn percentiles(samples: &VecDeque<u64>) -> LatencyPercentiles {
    if samples.is_empty() {
        return LatencyPercentiles::default();
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let at = |p: f64| -> u64 {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    LatencyPercentiles {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
    }
}

pub struct RetrievalEngine<P: EmbeddingProvider> {
    store: Arc<Store>,
    provider: Arc<P>,
    mode: RetrievalMode,
    weights: ScoreWeights,
    min_relevance: f64,
    scoring_timeout: Duration,
    injection_timeout: Duration,
    cache: Arc<AsyncMutex<HashMap<String, CacheEntry>>>,
    cache_ttl: Duration,
    cache_cap: usize,
    scoring_latencies: Arc<AsyncMutex<VecDeque<u64>>>,
    injection_latencies: Arc<AsyncMutex<VecDeque<u64>>>,
}

impl<P: EmbeddingProvider + 'static> RetrievalEngine<P> {
    pub fn new(store: Arc<Store>, provider: Arc<P>, config: RetrievalConfig) -> Self {
        Self {
            store,
            provider,
            mode: config.mode,
            weights: config.weights,
            min_relevance: config.min_relevance,
            scoring_timeout: Duration::from_millis(config.scoring_timeout_ms),
            injection_timeout: Duration::from_millis(config.injection_timeout_ms),
            cache: Arc::new(AsyncMutex::new(HashMap::new())),
            cache_ttl: Duration::from_secs(60),
            cache_cap: 100,
            scoring_latencies: Arc::new(AsyncMutex::new(VecDeque::with_capacity(LATENCY_SAMPLE_CAP))),
            injection_latencies: Arc::new(AsyncMutex::new(VecDeque::with_capacity(LATENCY_SAMPLE_CAP))),
        }
    }

    /// Latency percentiles observed so far for the scoring phase and for the
    /// end-to-end injection call, each over the last 100 samples.
    pub async fn latency_percentiles(&self) -> (LatencyPercentiles, LatencyPercentiles) {
        let scoring = percentiles(&*self.scoring_latencies.lock().await);
        let injection = percentiles(&*self.injection_latencies.lock().await);
        (scoring, injection)
    }

    async fn record_latency(buffer: &AsyncMutex<VecDeque<u64>>, store: &Store, metric: &str, sample_ms: u64) {
        let mut buf = buffer.lock().await;
        if buf.len() >= LATENCY_SAMPLE_CAP {
            buf.pop_front();
        }
        buf.push_back(sample_ms);
        drop(buf);
        let _ = store.record_metric(metric, sample_ms as f64).await;
    }

    fn derive_query(ctx: &RetrievalContext) -> Option<String> {
        if let Some(q) = &ctx.query {
            if !q.is_empty() {
                return Some(q.clone());
            }
        }
        for field in KNOWN_QUERY_FIELDS {
            if let Some(v) = ctx.tool_params.get(*field) {
                if !v.is_empty() {
                    return Some(v.clone());
                }
            }
        }
        None
    }

    fn cache_key(session_id: &str, query: &str) -> String {
        let prefix: String = query.chars().take(50).collect();
        format!("{session_id}:{prefix}")
    }

    fn token_budget(ctx: &RetrievalContext, min_tokens: i64, max_tokens: i64) -> i64 {
        if let Some(explicit) = ctx.token_budget {
            return explicit.min(max_tokens);
        }
        let remaining = (max_tokens - ctx.current_tokens).max(0);
        ((remaining as f64 * 0.2) as i64).clamp(min_tokens, max_tokens)
    }

    /// The engine's single public entry point (§4.H). Never returns an error to the host;
    /// all failures degrade to an empty payload.
    pub async fn inject_enhanced_memory(
        &self,
        ctx: RetrievalContext,
        min_tokens: i64,
        max_tokens: i64,
    ) -> InjectionResult {
        let start = Instant::now();
        match self.inject_inner(&ctx, min_tokens, max_tokens, start).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "retrieval failed, returning empty payload");
                InjectionResult::failed(e.to_string())
            }
        }
    }

    async fn inject_inner(
        &self,
        ctx: &RetrievalContext,
        min_tokens: i64,
        max_tokens: i64,
        start: Instant,
    ) -> crate::error::EngineResult<InjectionResult> {
        let query = match Self::derive_query(ctx) {
            Some(q) => q,
            None => return Ok(InjectionResult::empty()),
        };

        let key = Self::cache_key(&ctx.session_id, &query);
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    let mut result = entry.result.clone();
                    for s in &mut result.sources {
                        s.from_cache = true;
                    }
                    return Ok(result);
                }
                cache.remove(&key);
            }
        }

        let budget = Self::token_budget(ctx, min_tokens, max_tokens);
        let query_entities: HashSet<String> = extract_from_text(&query)
            .into_iter()
            .map(|e| e.value.to_lowercase())
            .collect();

        let tiers: Vec<MemoryTier> = if ctx.agent_id.is_some() {
            vec![MemoryTier::Project, MemoryTier::Agent]
        } else {
            vec![MemoryTier::Project, MemoryTier::Agent, MemoryTier::Conversation]
        };

        let mut candidates: HashMap<i64, (Message, Option<f64>)> = HashMap::new();

        let remaining = |start: Instant, budget: Duration| budget.saturating_sub(start.elapsed());

        if self.provider.is_semantic() {
            let fut = async {
                if let Ok(embedding) = self.provider.embed(&[query.clone()]).await {
                    if let Some(vector) = embedding.embeddings.first() {
                        if let Ok(hits) = self.store.ann_search(vector, 20).await {
                            for (message_id, distance) in hits {
                                let semantic = (1.0 - distance).clamp(0.0, 1.0);
                                if semantic < 0.3 {
                                    continue;
                                }
                                if let Ok(msg) = self.store.get_message(message_id).await {
                                    candidates.insert(message_id, (msg, Some(semantic)));
                                }
                            }
                        }
                    }
                }
            };
            // A per-source timeout just skips that source; it never fails the whole call.
            let _ = tokio::time::timeout(remaining(start, self.scoring_timeout), fut).await;
        }

        let tier_fut = self.store.search_by_tier(&query, &tiers, ctx.agent_id.clone(), 20);
        if let Ok(Ok(tier_hits)) = tokio::time::timeout(remaining(start, self.scoring_timeout), tier_fut).await {
            for msg in tier_hits {
                candidates.entry(msg.id).or_insert((msg, None));
            }
        }

        let recent_fut = self.store.recent_messages(&ctx.session_id, 10);
        if let Ok(recent) = tokio::time::timeout(remaining(start, self.scoring_timeout), recent_fut).await {
            for msg in recent.unwrap_or_default() {
                candidates.entry(msg.id).or_insert((msg, None));
            }
        }

        if candidates.is_empty() {
            return Ok(InjectionResult::empty());
        }

        if start.elapsed() >= self.injection_timeout {
            Self::record_latency(&self.injection_latencies, &self.store, "injection_latency_ms", start.elapsed().as_millis() as u64).await;
            return Ok(InjectionResult {
                cancelled: true,
                duration_ms: start.elapsed().as_millis() as u64,
                ..InjectionResult::empty()
            });
        }

        let scoring_start = Instant::now();
        let now = chrono::Utc::now();
        let query_tokens: HashSet<&str> = query.split_whitespace().collect();
        let mode = self.mode;
        let weights = self.weights;
        let mut scored: Vec<(Message, f64)> = candidates
            .into_values()
            .map(|(msg, semantic_hint)| {
                let score = match mode {
                    RetrievalMode::Enhanced => {
                        let semantic = semantic_hint.unwrap_or_else(|| jaccard_tokens(&query_tokens, &msg.content));
                        let age_ms = (now - msg.created_at).num_milliseconds().max(0) as f64;
                        let recency = (-age_ms / RECENCY_HALF_LIFE_MS).exp();
                        let tier = match msg.tier {
                            MemoryTier::Project => 1.0,
                            MemoryTier::Agent => 0.7,
                            MemoryTier::Conversation => 0.4,
                        };
                        let entity_overlap = entity_overlap(&query_entities, &msg.content);
                        weights.semantic * semantic + weights.recency * recency + weights.tier * tier + weights.entity * entity_overlap
                    }
                    RetrievalMode::Basic => score_basic(&msg, &query_tokens, now),
                };
                (msg, score)
            })
            .filter(|(_, score)| *score >= self.min_relevance)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Self::record_latency(&self.scoring_latencies, &self.store, "scoring_latency_ms", scoring_start.elapsed().as_millis() as u64).await;

        let mut payload_parts = Vec::new();
        let mut sources = Vec::new();
        let mut scores = HashMap::new();
        let mut tokens_used = 0i64;

        for (msg, score) in &scored {
            let formatted = format!(
                "**[{}] {} message** (relevance: {score:.2})\n{}",
                tier_label(&msg.tier),
                role_label(&msg.role),
                msg.content
            );
            let cost = estimate_tokens(&formatted);
            if tokens_used + cost > budget {
                break;
            }
            tokens_used += cost;
            payload_parts.push(formatted);
            sources.push(ScoredSource {
                message_id: msg.id,
                tier: msg.tier.clone(),
                score: *score,
                from_cache: false,
            });
            scores.insert(msg.id, *score);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        Self::record_latency(&self.injection_latencies, &self.store, "injection_latency_ms", duration_ms).await;

        let result = InjectionResult {
            payload: if payload_parts.is_empty() {
                None
            } else {
                Some(payload_parts.join("\n\n"))
            },
            tokens_used,
            sources,
            scores,
            duration_ms,
            cancelled: false,
            error: None,
        };

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.cache_cap {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
            }
        }
        cache.insert(
            key,
            CacheEntry {
                result: result.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(result)
    }
}

/// Legacy scoring path: recency + type-weighted similarity + a cost heuristic
/// that favors cheaper (shorter) content. Selected via `RetrievalMode::Basic`.
fn score_basic(msg: &Message, query_tokens: &HashSet<&str>, now: chrono::DateTime<chrono::Utc>) -> f64 {
    let age_ms = (now - msg.created_at).num_milliseconds().max(0) as f64;
    let recency = (-age_ms / RECENCY_HALF_LIFE_MS).exp();
    let type_weight = match msg.role {
        MessageRole::User => 1.0,
        MessageRole::Assistant => 0.8,
        MessageRole::System => 0.6,
        MessageRole::Tool => 0.5,
    };
    let similarity = jaccard_tokens(query_tokens, &msg.content);
    let cost_heuristic = 1.0 / (1.0 + estimate_tokens(&msg.content) as f64 / 100.0);
    0.5 * recency + 0.35 * (type_weight * similarity) + 0.15 * cost_heuristic
}

fn jaccard_tokens(query_tokens: &HashSet<&str>, content: &str) -> f64 {
    let content_lower = content.to_lowercase();
    let content_tokens: HashSet<&str> = content_lower.split_whitespace().collect();
    let query_lower: HashSet<String> = query_tokens.iter().map(|s| s.to_lowercase()).collect();
    let query_lower: HashSet<&str> = query_lower.iter().map(|s| s.as_str()).collect();
    let intersection = query_lower.intersection(&content_tokens).count();
    let union = query_lower.union(&content_tokens).count().max(1);
    intersection as f64 / union as f64
}

fn entity_overlap(query_entities: &HashSet<String>, content: &str) -> f64 {
    if query_entities.is_empty() {
        return 0.0;
    }
    let content_entities: HashSet<String> = extract_from_text(content)
        .into_iter()
        .map(|e| e.value.to_lowercase())
        .collect();
    if content_entities.is_empty() {
        return 0.0;
    }
    let intersection = query_entities.intersection(&content_entities).count();
    let union = query_entities.union(&content_entities).count().max(1);
    intersection as f64 / union as f64
}

fn tier_label(tier: &MemoryTier) -> &'static str {
    match tier {
        MemoryTier::Conversation => "CONVERSATION",
        MemoryTier::Agent => "AGENT",
        MemoryTier::Project => "PROJECT",
    }
}

fn role_label(role: &tapestry_schema::MessageRole) -> &'static str {
    match role {
        tapestry_schema::MessageRole::User => "user",
        tapestry_schema::MessageRole::Assistant => "assistant",
        tapestry_schema::MessageRole::System => "system",
        tapestry_schema::MessageRole::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubEmbeddingProvider;
    use tapestry_schema::{Conversation, MemoryTier as Tier, MessageRole, Session, SessionStatus};

    fn config_with(min_relevance: f64) -> RetrievalConfig {
        RetrievalConfig {
            min_relevance,
            ..RetrievalConfig::default()
        }
    }

    async fn setup() -> (Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = chrono::Utc::now();
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
        (store, conv_id)
    }

    fn msg(conv_id: i64, content: &str, tier: Tier) -> Message {
        let now = chrono::Utc::now();
        Message {
            id: 0,
            conversation_id: conv_id,
            role: MessageRole::User,
            content: content.to_string(),
            token_count: None,
            created_at: now,
            importance_score: 0.5,
            is_summarized: false,
            original_content: None,
            tier,
            agent_id: None,
            reference_count: 0,
            promotion_count: 0,
            tier_promoted_at: None,
            last_referenced_at: now,
            source_agent_id: None,
            shared_with_agents: Default::default(),
            handoff_id: None,
        }
    }

    #[tokio::test]
    async fn empty_query_returns_empty_result_not_an_error() {
        let (store, _conv) = setup().await;
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let engine = RetrievalEngine::new(store, provider, config_with(0.5));
        let result = engine
            .inject_enhanced_memory(RetrievalContext::default(), 1000, 40000)
            .await;
        assert!(result.payload.is_none());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn project_tier_recent_match_outranks_stale_conversation_tier() {
        let (store, conv_id) = setup().await;
        store
            .insert_message(msg(conv_id, "deploy pipeline status is green", Tier::Project))
            .await
            .unwrap();
        let mut old = msg(conv_id, "unrelated chit chat", Tier::Conversation);
        old.created_at = chrono::Utc::now() - chrono::Duration::days(10);
        store.insert_message(old).await.unwrap();

        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let engine = RetrievalEngine::new(store, provider, config_with(0.0));
        let ctx = RetrievalContext {
            session_id: "s1".into(),
            query: Some("deploy pipeline".into()),
            ..Default::default()
        };
        let result = engine.inject_enhanced_memory(ctx, 1000, 40000).await;
        assert!(result.payload.is_some());
        assert!(!result.sources.is_empty());
        assert_eq!(result.sources[0].tier, Tier::Project);
    }

    #[tokio::test]
    async fn token_budget_is_never_exceeded() {
        let (store, conv_id) = setup().await;
        for i in 0..5 {
            store
                .insert_message(msg(conv_id, &format!("message number {i} about rust programming"), Tier::Project))
                .await
                .unwrap();
        }
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let engine = RetrievalEngine::new(store, provider, config_with(0.0));
        let ctx = RetrievalContext {
            session_id: "s1".into(),
            query: Some("rust programming".into()),
            token_budget: Some(20),
            ..Default::default()
        };
        let result = engine.inject_enhanced_memory(ctx, 1000, 40000).await;
        assert!(result.tokens_used <= 20);
    }

    #[tokio::test]
    async fn basic_mode_scores_without_entity_or_ann_factors() {
        let (store, conv_id) = setup().await;
        store
            .insert_message(msg(conv_id, "rust programming notes", Tier::Project))
            .await
            .unwrap();
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let config = RetrievalConfig {
            mode: RetrievalMode::Basic,
            min_relevance: 0.0,
            ..RetrievalConfig::default()
        };
        let engine = RetrievalEngine::new(store, provider, config);
        let ctx = RetrievalContext {
            session_id: "s1".into(),
            query: Some("rust programming".into()),
            ..Default::default()
        };
        let result = engine.inject_enhanced_memory(ctx, 1000, 40000).await;
        assert!(result.payload.is_some());
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn zero_injection_timeout_cancels_and_returns_empty_payload() {
        let (store, conv_id) = setup().await;
        store
            .insert_message(msg(conv_id, "rust programming notes", Tier::Project))
            .await
            .unwrap();
        let provider = Arc::new(StubEmbeddingProvider::new(crate::migrations::vector_dim()));
        let config = RetrievalConfig {
            injection_timeout_ms: 0,
            ..RetrievalConfig::default()
        };
        let engine = RetrievalEngine::new(store, provider, config);
        let ctx = RetrievalContext {
            session_id: "s1".into(),
            query: Some("rust programming".into()),
            ..Default::default()
        };
        let result = engine.inject_enhanced_memory(ctx, 1000, 40000).await;
        assert!(result.cancelled);
        assert!(result.payload.is_none());
    }
}
