use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use tapestry_schema::{OverflowAction, OverflowThresholds, Session, SessionStatus};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;

use crate::error::{EngineError, EngineResult};
use crate::retrieval::estimate_tokens;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct OverflowOutcome {
    pub action: OverflowAction,
    pub compressed: usize,
    pub summarized: usize,
    pub new_session_id: Option<String>,
    pub critical_context: Vec<String>,
}

pub struct OverflowHandler {
    store: Arc<Store>,
    thresholds: OverflowThresholds,
    /// Serializes compress/summarize/handoff per session so they never interleave.
    session_locks: AsyncMutex<std::collections::HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OverflowHandler {
    pub fn new(store: Arc<Store>, thresholds: OverflowThresholds) -> Self {
        Self {
            store,
            thresholds,
            session_locks: AsyncMutex::new(std::collections::HashMap::new()),
        }
    }

    async fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn handle_overflow(
        &self,
        session_id: &str,
        current_tokens: i64,
        max_tokens: i64,
    ) -> EngineResult<OverflowOutcome> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let usage = current_tokens as f64 / max_tokens as f64;
        let t = &self.thresholds;

        if usage < t.warning {
            return Ok(OverflowOutcome {
                action: OverflowAction::None,
                compressed: 0,
                summarized: 0,
                new_session_id: None,
                critical_context: vec![],
            });
        }
        if usage < t.compress {
            tracing::warn!(session_id, usage, "approaching context limit");
            return Ok(OverflowOutcome {
                action: OverflowAction::Warn,
                compressed: 0,
                summarized: 0,
                new_session_id: None,
                critical_context: vec![],
            });
        }
        if usage < t.summarize {
            let compressed = self.compress_messages(session_id).await?;
            return Ok(OverflowOutcome {
                action: OverflowAction::Compress,
                compressed,
                summarized: 0,
                new_session_id: None,
                critical_context: vec![],
            });
        }
        if usage < t.handoff {
            let summarized = self.summarize_conversations(session_id).await?;
            return Ok(OverflowOutcome {
                action: OverflowAction::Summarize,
                compressed: 0,
                summarized,
                new_session_id: None,
                critical_context: vec![],
            });
        }

        let (new_session_id, critical_context) = self.handoff_session(session_id).await?;
        Ok(OverflowOutcome {
            action: OverflowAction::Handoff,
            compressed: 0,
            summarized: 0,
            new_session_id: Some(new_session_id),
            critical_context,
        })
    }

    /// Compresses up to 50 non-summarized messages outside the most recent 10 per conversation.
    async fn compress_messages(&self, session_id: &str) -> EngineResult<usize> {
        let db = self.store.conn();
        let session_id = session_id.to_string();
        let ids: Vec<i64> = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT m.id FROM messages m \
                     JOIN conversations c ON c.id = m.conversation_id \
                     WHERE c.session_id = ?1 AND m.is_summarized = 0 \
                     AND m.id NOT IN ( \
                        SELECT id FROM messages WHERE conversation_id = m.conversation_id \
                        ORDER BY created_at DESC, id DESC LIMIT 10) \
                     ORDER BY m.created_at ASC LIMIT 50",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([session_id], |r| r.get::<_, i64>(0))
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))??;

        if ids.is_empty() {
            return Ok(0);
        }
        self.store.mark_messages_summarized(&ids, 100).await?;
        Ok(ids.len())
    }

    /// Summarizes up to 5 ended, unsummarized conversations with a deterministic template.
    async fn summarize_conversations(&self, session_id: &str) -> EngineResult<usize> {
        let db = self.store.conn();
        let session_id = session_id.to_string();
        let conversations: Vec<(i64, Option<String>)> = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, title FROM conversations \
                     WHERE session_id = ?1 AND ended_at IS NOT NULL AND summary IS NULL LIMIT 5",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([session_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?)))
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))??;

        let mut count = 0;
        for (conv_id, title) in conversations {
            let messages = self
                .store
                .recent_messages_in_conversation(conv_id, 1000)
                .await?;
            if messages.is_empty() {
                continue;
            }
            let summary = if let Some(title) = title {
                truncate(&title, 200)
            } else {
                let first = truncate(&messages.first().unwrap().content, 80);
                let last = truncate(&messages.last().unwrap().content, 80);
                truncate(&format!("User requested: {first}. Result: {last}."), 200)
            };
            let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
            self.store.mark_messages_summarized(&ids, 100).await?;
            self.store.end_conversation(conv_id, Some(summary)).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Archives the session, composes a summary and critical context, and opens a fresh session.
    async fn handoff_session(&self, session_id: &str) -> EngineResult<(String, Vec<String>)> {
        let session = self.store.get_session(session_id).await?;
        let recent = self.store.recent_messages(session_id, 5).await?;
        let critical_context: Vec<String> = recent.iter().map(|m| m.content.clone()).collect();

        let summary = truncate(
            &format!(
                "Session {session_id} handed off after reaching context limit with {} recent messages.",
                recent.len()
            ),
            1000,
        );

        let new_session_id = format!("sess_{}_handoff", Utc::now().timestamp_millis());
        let now = Utc::now();
        self.store
            .create_session(Session {
                session_id: new_session_id.clone(),
                user_id: session.user_id.clone(),
                project_id: session.project_id.clone(),
                status: SessionStatus::Active,
                created_at: now,
                last_active_at: now,
                metadata: {
                    let mut m = session.metadata.clone();
                    m.insert("handoff_from".into(), serde_json::Value::String(session_id.to_string()));
                    m
                },
            })
            .await?;

        self.store.set_session_status(session_id, SessionStatus::Archived).await?;
        self.record_handoff(session_id, &new_session_id, &summary).await?;

        Ok((new_session_id, critical_context))
    }

    async fn record_handoff(&self, from: &str, to: &str, summary: &str) -> EngineResult<()> {
        let db = self.store.conn();
        let (from, to, summary) = (from.to_string(), to.to_string(), summary.to_string());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "INSERT INTO session_handoffs (from_session_id, to_session_id, summary, context_preserved, \
                 handoff_reason, created_at) VALUES (?1, ?2, ?3, '{}', 'context_overflow', ?4)",
                params![from, to, summary, Utc::now().to_rfc3339()],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

impl Store {
    pub async fn recent_messages_in_conversation(&self, conversation_id: i64, limit: i64) -> EngineResult<Vec<tapestry_schema::Message>> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, content, token_count, created_at, importance_score, \
                     is_summarized, original_content, tier, agent_id, reference_count, promotion_count, \
                     tier_promoted_at, last_referenced_at, source_agent_id, shared_with_agents, handoff_id \
                     FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![conversation_id, limit], crate::store::row_to_message_pub)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_schema::{Conversation, MemoryTier, MessageRole};

    async fn setup_session_with_messages(n: usize) -> Arc<Store> {
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
        for i in 0..n {
            store
                .insert_message(tapestry_schema::Message {
                    id: 0,
                    conversation_id: conv_id,
                    role: MessageRole::User,
                    content: format!("message body number {i} with enough text to estimate tokens from"),
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
        }
        store
    }

    #[tokio::test]
    async fn overflow_sequence_walks_through_thresholds() {
        let store = setup_session_with_messages(30).await;
        let handler = OverflowHandler::new(store, OverflowThresholds::default());

        let r1 = handler.handle_overflow("s1", 90_000, 100_000).await.unwrap();
        assert_eq!(r1.action, OverflowAction::Compress);

        let r2 = handler.handle_overflow("s1", 93_000, 100_000).await.unwrap();
        assert_eq!(r2.action, OverflowAction::Summarize);

        let r3 = handler.handle_overflow("s1", 97_000, 100_000).await.unwrap();
        assert_eq!(r3.action, OverflowAction::Handoff);
        assert_eq!(r3.critical_context.len(), 5);
        let new_id = r3.new_session_id.unwrap();
        assert!(new_id.starts_with("sess_") && new_id.ends_with("_handoff"));
    }

    #[tokio::test]
    async fn below_warning_threshold_is_a_no_op() {
        let store = setup_session_with_messages(5).await;
        let handler = OverflowHandler::new(store, OverflowThresholds::default());
        let r = handler.handle_overflow("s1", 10_000, 100_000).await.unwrap();
        assert_eq!(r.action, OverflowAction::None);
    }
}
