use chrono::Utc;
use rusqlite::params;
use tapestry_schema::{MemoryTier, Message, TierThresholds};
use tokio::task;

use crate::error::{EngineError, EngineResult};
use crate::store::{parse_tier, row_to_message_pub, tier_as_str, Store};

#[derive(Debug, Clone)]
pub struct PromotionResult {
    pub promoted: bool,
    pub from_tier: MemoryTier,
    pub to_tier: MemoryTier,
    pub reason: String,
}

impl Store {
    /// Records a reference to a message by `ref_agent` and promotes its tier once the
    /// configured threshold is crossed. Promotion never reverses.
    pub async fn reference_memory(
        &self,
        message_id: i64,
        ref_agent: &str,
        thresholds: TierThresholds,
    ) -> EngineResult<PromotionResult> {
        let db = self.conn();
        let ref_agent = ref_agent.to_string();
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let tx = conn.transaction().map_err(EngineError::from)?;

            let (tier_str, reference_count, shared_raw): (String, i64, String) = tx
                .query_row(
                    "SELECT tier, reference_count, shared_with_agents FROM messages WHERE id = ?1",
                    [message_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .map_err(|_| EngineError::NotFound(format!("message {message_id}")))?;
            let tier = parse_tier(&tier_str);
            let new_count = reference_count + 1;
            let now = Utc::now().to_rfc3339();

            let mut shared: std::collections::HashSet<String> =
                serde_json::from_str(&shared_raw).unwrap_or_default();
            shared.insert(ref_agent.clone());
            let shared_json = serde_json::to_string(&shared).unwrap_or_else(|_| "[]".into());

            tx.execute(
                "UPDATE messages SET reference_count = ?1, last_referenced_at = ?2, shared_with_agents = ?3 \
                 WHERE id = ?4",
                params![new_count, now, shared_json, message_id],
            )
            .map_err(EngineError::from)?;

            let target = match tier {
                MemoryTier::Conversation if new_count >= thresholds.conversation_to_agent => {
                    Some(MemoryTier::Agent)
                }
                MemoryTier::Agent if new_count >= thresholds.agent_to_project => {
                    Some(MemoryTier::Project)
                }
                _ => None,
            };

            let result = if let Some(to_tier) = target {
                tx.execute(
                    "UPDATE messages SET tier = ?1, promotion_count = promotion_count + 1, \
                     tier_promoted_at = ?2 WHERE id = ?3",
                    params![tier_as_str(&to_tier), now, message_id],
                )
                .map_err(EngineError::from)?;
                PromotionResult {
                    promoted: true,
                    from_tier: tier,
                    to_tier,
                    reason: format!("reference_count {new_count} reached threshold"),
                }
            } else {
                PromotionResult {
                    promoted: false,
                    from_tier: tier.clone(),
                    to_tier: tier,
                    reason: "threshold not yet reached".to_string(),
                }
            };

            tx.commit().map_err(EngineError::from)?;
            Ok(result)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Cross-tier FTS search, ranked by tier priority then FTS rank then importance.
    pub async fn search_by_tier(
        &self,
        query: &str,
        tiers: &[MemoryTier],
        agent_id: Option<String>,
        limit: i64,
    ) -> EngineResult<Vec<Message>> {
        let db = self.conn();
        let query = query.to_string();
        let tier_list: Vec<&'static str> = tiers.iter().map(tier_as_str).collect();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let placeholders = tier_list.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let agent_clause = if agent_id.is_some() {
                "AND (m.agent_id = ? OR m.tier = 'project')"
            } else {
                ""
            };
            let sql = format!(
                "SELECT m.* FROM messages m JOIN messages_fts ON messages_fts.rowid = m.id \
                 WHERE messages_fts MATCH ? AND m.tier IN ({placeholders}) {agent_clause} \
                 ORDER BY CASE m.tier WHEN 'project' THEN 3 WHEN 'agent' THEN 2 ELSE 1 END DESC, \
                 bm25(messages_fts) ASC, m.importance_score DESC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql).map_err(EngineError::from)?;
            let mut bound: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(query)];
            for t in &tier_list {
                bound.push(Box::new(t.to_string()));
            }
            if let Some(a) = &agent_id {
                bound.push(Box::new(a.clone()));
            }
            bound.push(Box::new(limit));
            let params_ref: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(params_ref.as_slice(), row_to_message_pub)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Deletes expired conversation/agent-tier rows. Project tier never expires.
    pub async fn expire_old(&self, conversation_ttl_hours: i64, agent_ttl_hours: i64) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let conv_cutoff = Utc::now() - chrono::Duration::hours(conversation_ttl_hours);
            let agent_cutoff = Utc::now() - chrono::Duration::hours(agent_ttl_hours);
            let mut deleted = conn
                .execute(
                    "DELETE FROM messages WHERE tier = 'conversation' AND created_at < ?1",
                    [conv_cutoff.to_rfc3339()],
                )
                .map_err(EngineError::from)?;
            deleted += conn
                .execute(
                    "DELETE FROM messages WHERE tier = 'agent' AND created_at < ?1",
                    [agent_cutoff.to_rfc3339()],
                )
                .map_err(EngineError::from)?;
            Ok(deleted as i64)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_schema::{Conversation, MessageRole, Session, SessionStatus};

    async fn setup_message(store: &Store) -> i64 {
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
                role: MessageRole::User,
                content: "hello world".into(),
                token_count: None,
                created_at: now,
                importance_score: 0.5,
                is_summarized: false,
                original_content: None,
                tier: MemoryTier::Conversation,
                agent_id: Some("agent-a".into()),
                reference_count: 0,
                promotion_count: 0,
                tier_promoted_at: None,
                last_referenced_at: now,
                source_agent_id: None,
                shared_with_agents: Default::default(),
                handoff_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn promotes_conversation_to_agent_at_threshold() {
        let store = Store::open_in_memory().unwrap();
        let id = setup_message(&store).await;
        let thresholds = TierThresholds::default();
        let mut last = None;
        for _ in 0..thresholds.conversation_to_agent {
            last = Some(store.reference_memory(id, "agent-a", thresholds).await.unwrap());
        }
        let last = last.unwrap();
        assert!(last.promoted);
        assert_eq!(last.to_tier, MemoryTier::Agent);
    }

    #[tokio::test]
    async fn promotes_agent_to_project_after_two_thresholds() {
        let store = Store::open_in_memory().unwrap();
        let id = setup_message(&store).await;
        let thresholds = TierThresholds::default();
        for _ in 0..(thresholds.conversation_to_agent + thresholds.agent_to_project) {
            store.reference_memory(id, "agent-a", thresholds).await.unwrap();
        }
        let msg = store.get_message(id).await.unwrap();
        assert_eq!(msg.tier, MemoryTier::Project);
        assert_eq!(msg.promotion_count, 2);
    }
}
