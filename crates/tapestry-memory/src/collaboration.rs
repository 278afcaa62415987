use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use tapestry_schema::{CollaborationConfig, CollaborationStatus, HandoffType, MergeStrategy, Message};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use uuid::Uuid;

use crate::entities::extract_from_text;
use crate::error::{EngineError, EngineResult};
use crate::retrieval::estimate_tokens;
use crate::store::Store;

/// Agents this workspace is aware of at build time. Unknown ids are rejected
/// even if they pass the shape check.
const KNOWN_AGENTS: &[&str] = &[
    "orchestrator",
    "planner",
    "coder",
    "reviewer",
    "researcher",
    "tester",
];

/// Fuzzy-dedup threshold used when writing extracted entities through the shared registry.
const HANDOFF_ENTITY_SIMILARITY_THRESHOLD: f64 = 0.85;
const HANDOFF_ENTITY_MAX_CONTEXT_LENGTH: usize = 500;

fn agent_id_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$|^[a-z]{2,}$").unwrap())
}

pub fn validate_agent_id(raw: &str) -> EngineResult<String> {
    let normalized = raw.trim().to_lowercase();
    if !agent_id_regex().is_match(&normalized) {
        return Err(EngineError::InvalidAgentId(raw.to_string()));
    }
    if !KNOWN_AGENTS.contains(&normalized.as_str()) {
        return Err(EngineError::InvalidAgentId(raw.to_string()));
    }
    Ok(normalized)
}

#[derive(Debug, Clone)]
pub struct HandoffParams {
    pub session_id: String,
    pub workflow_id: Option<String>,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub handoff_type: HandoffType,
    pub target_task: String,
    pub max_memories: i64,
    pub max_entities: usize,
    pub token_budget: i64,
}

#[derive(Debug, Clone)]
pub struct PreparedHandoff {
    pub handoff_id: String,
    pub payload: String,
}

pub struct CollaborationManager {
    store: Arc<Store>,
    config: CollaborationConfig,
    violations: AsyncMutex<HashMap<String, Vec<Instant>>>,
}

impl CollaborationManager {
    pub fn new(store: Arc<Store>, config: CollaborationConfig) -> Self {
        Self {
            store,
            config,
            violations: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn breaker_is_open(&self, session_id: &str) -> bool {
        let mut violations = self.violations.lock().await;
        let window = Duration::from_millis(self.config.circuit_breaker_cooldown_ms);
        let entry = violations.entry(session_id.to_string()).or_default();
        entry.retain(|t| t.elapsed() < window);
        entry.len() as u32 >= self.config.max_circular_violations
    }

    async fn record_violation(&self, session_id: &str) {
        let mut violations = self.violations.lock().await;
        violations.entry(session_id.to_string()).or_default().push(Instant::now());
    }

    /// Registers a collaboration edge after agent-id, cycle, and circuit-breaker checks.
    pub async fn register_handoff(
        &self,
        session_id: &str,
        workflow_id: Option<String>,
        source_agent_id: &str,
        target_agent_id: &str,
        handoff_type: HandoffType,
        context: String,
    ) -> EngineResult<tapestry_schema::Collaboration> {
        let source = validate_agent_id(source_agent_id)?;
        let target = validate_agent_id(target_agent_id)?;

        if self.breaker_is_open(session_id).await {
            return Err(EngineError::CircuitBreakerOpen {
                session_id: session_id.to_string(),
            });
        }

        let edges = self.store.collaboration_edges(session_id).await?;
        if self.config.block_circular_handoffs
            && path_exists(&edges, &target, &source, self.config.circular_detection_depth)
        {
            self.record_violation(session_id).await;
            let handoff_id = format!("ho_{}", Uuid::new_v4());
            self.store
                .insert_collaboration(
                    session_id,
                    workflow_id.as_deref(),
                    &source,
                    &target,
                    &handoff_id,
                    &context,
                    handoff_type,
                    CollaborationStatus::Rejected,
                )
                .await?;
            return Err(EngineError::CircularHandoff { source, target });
        }

        if chain_length(&edges, &source) + 1 >= self.config.max_chain_length {
            tracing::warn!(session_id, source, target, "collaboration chain is growing long");
        }

        let handoff_id = format!("ho_{}", Uuid::new_v4());
        self.store
            .insert_collaboration(
                session_id,
                workflow_id.as_deref(),
                &source,
                &target,
                &handoff_id,
                &context,
                handoff_type,
                CollaborationStatus::Pending,
            )
            .await?;
        self.store.get_collaboration(&handoff_id).await
    }

    /// Builds the transferable memory payload for a handoff and persists it as pending.
    pub async fn prepare_handoff(&self, params: HandoffParams) -> EngineResult<PreparedHandoff> {
        let collab = self
            .register_handoff(
                &params.session_id,
                params.workflow_id.clone(),
                &params.source_agent_id,
                &params.target_agent_id,
                params.handoff_type.clone(),
                params.target_task.clone(),
            )
            .await?;

        let recent = self
            .store
            .recent_messages_for_agent(&params.session_id, &collab.source_agent_id, params.max_memories)
            .await?;

        let mut extracted_values: HashSet<(String, String)> = HashSet::new();
        for m in &recent {
            for e in extract_from_text(&m.content) {
                if extracted_values.insert((e.entity_type.clone(), e.value.clone())) {
                    self.store
                        .get_global_entity(
                            &e.entity_type,
                            &e.value,
                            &collab.source_agent_id,
                            HANDOFF_ENTITY_SIMILARITY_THRESHOLD,
                            MergeStrategy::MergeContext,
                            HANDOFF_ENTITY_MAX_CONTEXT_LENGTH,
                        )
                        .await?;
                }
            }
        }

        let task_tokens: HashSet<&str> = params.target_task.split_whitespace().collect();
        let mut scored: Vec<(&Message, f64)> = recent
            .iter()
            .map(|m| (m, jaccard_similarity(&task_tokens, &m.content)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        let mut tokens_used = 0i64;
        for (m, score) in scored {
            let cost = estimate_tokens(&m.content);
            if tokens_used + cost > params.token_budget {
                continue;
            }
            tokens_used += cost;
            selected.push((m, score));
        }

        let entities = self
            .store
            .search_entities("", None, params.max_entities as i64)
            .await
            .unwrap_or_default();

        let mut sections = Vec::new();
        if !selected.is_empty() {
            let memories: Vec<String> = selected
                .iter()
                .map(|(m, score)| format!("- ({:?}, relevance {score:.2}) {}", m.role, m.content))
                .collect();
            sections.push(format!("Shared Memories:\n{}", memories.join("\n")));
        }
        if !entities.is_empty() {
            let known: Vec<String> = entities
                .iter()
                .take(params.max_entities)
                .map(|e| format!("- {} ({})", e.value, e.entity_type))
                .collect();
            sections.push(format!("Known Entities:\n{}", known.join("\n")));
        }
        let payload = sections.join("\n\n");

        self.store.set_collaboration_context(&collab.handoff_id, &payload).await?;

        Ok(PreparedHandoff {
            handoff_id: collab.handoff_id,
            payload,
        })
    }

    /// Marks a pending handoff applied and returns its payload for prompt injection.
    pub async fn apply_handoff_context(&self, handoff_id: &str) -> EngineResult<String> {
        let collab = self.store.get_collaboration(handoff_id).await?;
        if collab.status != CollaborationStatus::Pending {
            return Err(EngineError::ConstraintViolation(format!(
                "handoff {handoff_id} is not pending"
            )));
        }
        self.store.apply_collaboration(handoff_id).await?;
        Ok(collab.handoff_context)
    }
}

fn jaccard_similarity(task_tokens: &HashSet<&str>, content: &str) -> f64 {
    let content_lower = content.to_lowercase();
    let content_tokens: HashSet<&str> = content_lower.split_whitespace().collect();
    let task_lower: HashSet<String> = task_tokens.iter().map(|s| s.to_lowercase()).collect();
    let task_lower: HashSet<&str> = task_lower.iter().map(|s| s.as_str()).collect();
    let intersection = task_lower.intersection(&content_tokens).count();
    let union = task_lower.union(&content_tokens).count().max(1);
    intersection as f64 / union as f64
}

/// BFS from `from` to `to` over accepted (non-rejected) edges, bounded by `max_depth`.
fn path_exists(edges: &[(String, String)], from: &str, to: &str, max_depth: usize) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (s, t) in edges {
        adjacency.entry(s.as_str()).or_default().push(t.as_str());
    }
    let mut frontier = vec![from];
    let mut visited: HashSet<&str> = HashSet::from([from]);
    for _ in 0..max_depth {
        let mut next = Vec::new();
        for node in &frontier {
            if *node == to {
                return true;
            }
            if let Some(neighbors) = adjacency.get(node) {
                for n in neighbors {
                    if visited.insert(n) {
                        next.push(*n);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    frontier.contains(&to)
}

fn chain_length(edges: &[(String, String)], source: &str) -> usize {
    edges.iter().filter(|(s, _)| s == source).count()
}

pub fn handoff_type_as_str(t: &HandoffType) -> &'static str {
    match t {
        HandoffType::Sequential => "sequential",
        HandoffType::Parallel => "parallel",
        HandoffType::Fork => "fork",
        HandoffType::Join => "join",
    }
}

fn parse_handoff_type(s: &str) -> HandoffType {
    match s {
        "parallel" => HandoffType::Parallel,
        "fork" => HandoffType::Fork,
        "join" => HandoffType::Join,
        _ => HandoffType::Sequential,
    }
}

pub fn collaboration_status_as_str(s: &CollaborationStatus) -> &'static str {
    match s {
        CollaborationStatus::Pending => "pending",
        CollaborationStatus::Applied => "applied",
        CollaborationStatus::Rejected => "rejected",
    }
}

fn parse_collaboration_status(s: &str) -> CollaborationStatus {
    match s {
        "applied" => CollaborationStatus::Applied,
        "rejected" => CollaborationStatus::Rejected,
        _ => CollaborationStatus::Pending,
    }
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_collaboration(
        &self,
        session_id: &str,
        workflow_id: Option<&str>,
        source_agent_id: &str,
        target_agent_id: &str,
        handoff_id: &str,
        handoff_context: &str,
        handoff_type: HandoffType,
        status: CollaborationStatus,
    ) -> EngineResult<()> {
        let db = self.conn();
        let (session_id, workflow_id, source, target, handoff_id, context) = (
            session_id.to_string(),
            workflow_id.map(str::to_string),
            source_agent_id.to_string(),
            target_agent_id.to_string(),
            handoff_id.to_string(),
            handoff_context.to_string(),
        );
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                r#"INSERT INTO agent_collaborations (
                    session_id, workflow_id, source_agent_id, target_agent_id, handoff_id,
                    handoff_context, handoff_type, status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    session_id,
                    workflow_id,
                    source,
                    target,
                    handoff_id,
                    context,
                    handoff_type_as_str(&handoff_type),
                    collaboration_status_as_str(&status),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn get_collaboration(&self, handoff_id: &str) -> EngineResult<tapestry_schema::Collaboration> {
        let db = self.conn();
        let handoff_id = handoff_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.query_row(
                "SELECT * FROM agent_collaborations WHERE handoff_id = ?1",
                [&handoff_id],
                row_to_collaboration,
            )
            .optional()
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("handoff {handoff_id}")))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn set_collaboration_context(&self, handoff_id: &str, context: &str) -> EngineResult<()> {
        let db = self.conn();
        let (handoff_id, context) = (handoff_id.to_string(), context.to_string());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE agent_collaborations SET handoff_context = ?1 WHERE handoff_id = ?2",
                params![context, handoff_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn apply_collaboration(&self, handoff_id: &str) -> EngineResult<()> {
        let db = self.conn();
        let handoff_id = handoff_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE agent_collaborations SET status = 'applied', applied_at = ?1 WHERE handoff_id = ?2",
                params![Utc::now().to_rfc3339(), handoff_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// All non-rejected (source, target) edges for a session's collaboration graph.
    pub async fn collaboration_edges(&self, session_id: &str) -> EngineResult<Vec<(String, String)>> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT source_agent_id, target_agent_id FROM agent_collaborations \
                     WHERE session_id = ?1 AND status != 'rejected'",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([session_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn recent_messages_for_agent(&self, session_id: &str, agent_id: &str, limit: i64) -> EngineResult<Vec<Message>> {
        let db = self.conn();
        let (session_id, agent_id) = (session_id.to_string(), agent_id.to_string());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, content, token_count, created_at, importance_score, \
                     is_summarized, original_content, tier, agent_id, reference_count, promotion_count, \
                     tier_promoted_at, last_referenced_at, source_agent_id, shared_with_agents, handoff_id \
                     FROM messages WHERE conversation_id IN (SELECT id FROM conversations WHERE session_id = ?1) \
                     AND agent_id = ?2 ORDER BY created_at DESC, id DESC LIMIT ?3",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![session_id, agent_id, limit], crate::store::row_to_message_pub)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Deletes pending collaborations older than `ttl` as an expired-handoff sweep.
    pub async fn expire_pending_handoffs(&self, ttl: chrono::Duration) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let cutoff = (Utc::now() - ttl).to_rfc3339();
            let deleted = conn
                .execute(
                    "DELETE FROM agent_collaborations WHERE status = 'pending' AND created_at < ?1",
                    [cutoff],
                )
                .map_err(EngineError::from)?;
            Ok(deleted as i64)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

fn row_to_collaboration(row: &rusqlite::Row) -> rusqlite::Result<tapestry_schema::Collaboration> {
    let handoff_type: String = row.get("handoff_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let applied_at: Option<String> = row.get("applied_at")?;
    Ok(tapestry_schema::Collaboration {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        workflow_id: row.get("workflow_id")?,
        source_agent_id: row.get("source_agent_id")?,
        target_agent_id: row.get("target_agent_id")?,
        handoff_id: row.get("handoff_id")?,
        handoff_context: row.get("handoff_context")?,
        handoff_type: parse_handoff_type(&handoff_type),
        status: parse_collaboration_status(&status),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        applied_at: applied_at.and_then(|t| t.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_schema::{Conversation, MemoryTier, MessageRole, Session, SessionStatus};

    async fn setup() -> Arc<Store> {
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
        store
            .insert_message(Message {
                id: 0,
                conversation_id: conv_id,
                role: MessageRole::Assistant,
                content: "planned the deployment rollout".into(),
                token_count: None,
                created_at: now,
                importance_score: 0.5,
                is_summarized: false,
                original_content: None,
                tier: MemoryTier::Conversation,
                agent_id: Some("planner".into()),
                reference_count: 0,
                promotion_count: 0,
                tier_promoted_at: None,
                last_referenced_at: now,
                source_agent_id: Some("planner".into()),
                shared_with_agents: Default::default(),
                handoff_id: None,
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn rejects_unknown_agent_id() {
        assert!(validate_agent_id("made-up-agent").is_err());
        assert!(validate_agent_id("planner").is_ok());
    }

    #[tokio::test]
    async fn registers_a_pending_handoff() {
        let store = setup().await;
        let manager = CollaborationManager::new(store, CollaborationConfig::default());
        let collab = manager
            .register_handoff("s1", None, "planner", "coder", HandoffType::Sequential, "start coding".into())
            .await
            .unwrap();
        assert_eq!(collab.status, CollaborationStatus::Pending);
    }

    #[tokio::test]
    async fn rejects_a_handoff_that_would_close_a_cycle() {
        let store = setup().await;
        let manager = CollaborationManager::new(store, CollaborationConfig::default());
        manager
            .register_handoff("s1", None, "planner", "coder", HandoffType::Sequential, "go".into())
            .await
            .unwrap();
        manager
            .register_handoff("s1", None, "coder", "reviewer", HandoffType::Sequential, "go".into())
            .await
            .unwrap();
        let err = manager
            .register_handoff("s1", None, "reviewer", "planner", HandoffType::Sequential, "go".into())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CircularHandoff { .. }));
    }

    #[tokio::test]
    async fn prepares_and_applies_a_handoff_payload() {
        let store = setup().await;
        let manager = CollaborationManager::new(store, CollaborationConfig::default());
        let prepared = manager
            .prepare_handoff(HandoffParams {
                session_id: "s1".into(),
                workflow_id: None,
                source_agent_id: "planner".into(),
                target_agent_id: "coder".into(),
                handoff_type: HandoffType::Sequential,
                target_task: "deployment rollout".into(),
                max_memories: 10,
                max_entities: 10,
                token_budget: 5000,
            })
            .await
            .unwrap();
        assert!(prepared.payload.contains("Shared Memories"));
        let payload = manager.apply_handoff_context(&prepared.handoff_id).await.unwrap();
        assert_eq!(payload, prepared.payload);
    }
}
