use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use tapestry_schema::{CheckpointType, ResumeCheckpoint};
use tokio::task;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    Full,
    Summary,
}

#[derive(Debug, Clone)]
pub struct ResumePayload {
    pub checkpoint_id: String,
    pub text: String,
}

pub struct ResumeService {
    store: Arc<Store>,
}

impl ResumeService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Snapshots the session's memory and entity state into a fresh checkpoint.
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        checkpoint_type: CheckpointType,
        agents_involved: Vec<String>,
    ) -> EngineResult<ResumeCheckpoint> {
        let recent = self.store.recent_messages(session_id, 200).await?;
        let memory_snapshot = json!({
            "messages": recent.iter().map(|m| json!({
                "id": m.id,
                "role": m.role,
                "content": m.content,
                "tier": m.tier,
                "created_at": m.created_at,
            })).collect::<Vec<_>>(),
        });

        let entity_snapshot = if agents_involved.is_empty() {
            json!({ "entities": [] })
        } else {
            let entities = self.store.search_entities("", None, 200).await.unwrap_or_default();
            json!({
                "entities": entities.iter().map(|e| json!({
                    "id": e.id,
                    "type": e.entity_type,
                    "value": e.value,
                    "confidence": e.confidence,
                })).collect::<Vec<_>>(),
            })
        };

        let checkpoint = ResumeCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_id: format!("ckpt_{}", Uuid::new_v4()),
            checkpoint_type,
            memory_snapshot,
            entity_snapshot,
            agents_involved,
            created_at: Utc::now(),
            resume_count: 0,
            last_resumed_at: None,
            is_archived: false,
        };
        self.store.insert_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Loads a checkpoint and formats a replay payload for the given mode.
    pub async fn resume_session(&self, checkpoint_id: &str, mode: ResumeMode) -> EngineResult<ResumePayload> {
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;
        let conversations = self.store.recent_conversations(&checkpoint.session_id, 5).await?;
        let messages: Vec<tapestry_schema::Message> = match mode {
            ResumeMode::Full => self.store.recent_messages(&checkpoint.session_id, 200).await?,
            ResumeMode::Summary => self.store.recent_messages(&checkpoint.session_id, 20).await?,
        };
        let mut ordered = messages;
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut text = format!(
            "Session {} resumed from checkpoint {} (type {:?})\n\n",
            checkpoint.session_id, checkpoint.checkpoint_id, checkpoint.checkpoint_type
        );
        if !conversations.is_empty() {
            text.push_str("Recent conversations:\n");
            for c in &conversations {
                text.push_str(&format!(
                    "- {}{}\n",
                    c.title.clone().unwrap_or_else(|| format!("conversation {}", c.id)),
                    c.summary.as_ref().map(|s| format!(": {s}")).unwrap_or_default()
                ));
            }
            text.push('\n');
        }
        text.push_str("Messages:\n");
        for m in &ordered {
            text.push_str(&format!("[{:?}] {}\n", m.role, m.content));
        }

        self.store.bump_checkpoint_resume(checkpoint_id).await?;

        Ok(ResumePayload {
            checkpoint_id: checkpoint.checkpoint_id,
            text,
        })
    }

    pub async fn get_resume_points(&self, session_id: &str) -> EngineResult<Vec<ResumeCheckpoint>> {
        self.store.list_checkpoints(session_id).await
    }
}

pub fn checkpoint_type_as_str(t: &CheckpointType) -> &'static str {
    match t {
        CheckpointType::Manual => "manual",
        CheckpointType::Automatic => "automatic",
        CheckpointType::Workflow => "workflow",
        CheckpointType::Milestone => "milestone",
    }
}

fn parse_checkpoint_type(s: &str) -> CheckpointType {
    match s {
        "automatic" => CheckpointType::Automatic,
        "workflow" => CheckpointType::Workflow,
        "milestone" => CheckpointType::Milestone,
        _ => CheckpointType::Manual,
    }
}

impl Store {
    pub async fn insert_checkpoint(&self, checkpoint: &ResumeCheckpoint) -> EngineResult<()> {
        let db = self.conn();
        let checkpoint = checkpoint.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                r#"INSERT INTO session_resume_checkpoints (
                    checkpoint_id, session_id, checkpoint_type, memory_snapshot, entity_snapshot,
                    agents_involved, created_at, resume_count, last_resumed_at, is_archived
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, 0)"#,
                params![
                    checkpoint.checkpoint_id,
                    checkpoint.session_id,
                    checkpoint_type_as_str(&checkpoint.checkpoint_type),
                    checkpoint.memory_snapshot.to_string(),
                    checkpoint.entity_snapshot.to_string(),
                    serde_json::to_string(&checkpoint.agents_involved).unwrap_or_else(|_| "[]".into()),
                    checkpoint.created_at.to_rfc3339(),
                ],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> EngineResult<ResumeCheckpoint> {
        let db = self.conn();
        let checkpoint_id = checkpoint_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.query_row(
                "SELECT * FROM session_resume_checkpoints WHERE checkpoint_id = ?1",
                [&checkpoint_id],
                row_to_checkpoint,
            )
            .optional()
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {checkpoint_id}")))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn bump_checkpoint_resume(&self, checkpoint_id: &str) -> EngineResult<()> {
        let db = self.conn();
        let checkpoint_id = checkpoint_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE session_resume_checkpoints SET resume_count = resume_count + 1, \
                 last_resumed_at = ?1 WHERE checkpoint_id = ?2",
                params![Utc::now().to_rfc3339(), checkpoint_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Non-archived checkpoints for a session, newest first.
    pub async fn list_checkpoints(&self, session_id: &str) -> EngineResult<Vec<ResumeCheckpoint>> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM session_resume_checkpoints WHERE session_id = ?1 AND is_archived = 0 \
                     ORDER BY created_at DESC",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([session_id], row_to_checkpoint)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn recent_conversations(&self, session_id: &str, limit: i64) -> EngineResult<Vec<tapestry_schema::Conversation>> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, title, started_at, ended_at, message_count, summary \
                     FROM conversations WHERE session_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                )
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![session_id, limit], row_to_conversation)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<tapestry_schema::Conversation> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    Ok(tapestry_schema::Conversation {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        title: row.get("title")?,
        started_at: started_at.parse().unwrap_or_else(|_| Utc::now()),
        ended_at: ended_at.and_then(|t| t.parse().ok()),
        message_count: row.get("message_count")?,
        summary: row.get("summary")?,
    })
}

fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<ResumeCheckpoint> {
    let checkpoint_type: String = row.get("checkpoint_type")?;
    let memory_snapshot: String = row.get("memory_snapshot")?;
    let entity_snapshot: String = row.get("entity_snapshot")?;
    let agents_involved: String = row.get("agents_involved")?;
    let created_at: String = row.get("created_at")?;
    let last_resumed_at: Option<String> = row.get("last_resumed_at")?;
    Ok(ResumeCheckpoint {
        session_id: row.get("session_id")?,
        checkpoint_id: row.get("checkpoint_id")?,
        checkpoint_type: parse_checkpoint_type(&checkpoint_type),
        memory_snapshot: serde_json::from_str(&memory_snapshot).unwrap_or(serde_json::Value::Null),
        entity_snapshot: serde_json::from_str(&entity_snapshot).unwrap_or(serde_json::Value::Null),
        agents_involved: serde_json::from_str(&agents_involved).unwrap_or_default(),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        resume_count: row.get("resume_count")?,
        last_resumed_at: last_resumed_at.and_then(|t| t.parse().ok()),
        is_archived: row.get("is_archived")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_schema::{Conversation, MemoryTier, Message, MessageRole, Session, SessionStatus};

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
                title: Some("deploy work".into()),
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
                content: "let's ship it".into(),
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
        store
    }

    #[tokio::test]
    async fn checkpoint_then_resume_round_trips_messages() {
        let store = setup().await;
        let service = ResumeService::new(store);
        let checkpoint = service
            .create_checkpoint("s1", CheckpointType::Manual, vec![])
            .await
            .unwrap();
        let resumed = service.resume_session(&checkpoint.checkpoint_id, ResumeMode::Full).await.unwrap();
        assert!(resumed.text.contains("ship it"));
    }

    #[tokio::test]
    async fn resuming_increments_resume_count() {
        let store = setup().await;
        let service = ResumeService::new(store);
        let checkpoint = service
            .create_checkpoint("s1", CheckpointType::Automatic, vec!["planner".into()])
            .await
            .unwrap();
        service.resume_session(&checkpoint.checkpoint_id, ResumeMode::Summary).await.unwrap();
        let points = service.get_resume_points("s1").await.unwrap();
        assert_eq!(points[0].resume_count, 1);
    }
}
