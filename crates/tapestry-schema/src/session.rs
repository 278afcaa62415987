use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Conversation,
    Agent,
    Project,
}

impl MemoryTier {
    /// Higher priority wins ties in cross-tier retrieval ranking.
    pub fn priority(&self) -> i32 {
        match self {
            MemoryTier::Project => 3,
            MemoryTier::Agent => 2,
            MemoryTier::Conversation => 1,
        }
    }

    pub fn next(&self) -> Option<MemoryTier> {
        match self {
            MemoryTier::Conversation => Some(MemoryTier::Agent),
            MemoryTier::Agent => Some(MemoryTier::Project),
            MemoryTier::Project => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub token_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_importance")]
    pub importance_score: f64,
    #[serde(default)]
    pub is_summarized: bool,
    #[serde(default)]
    pub original_content: Option<String>,
    #[serde(default = "default_tier")]
    pub tier: MemoryTier,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub reference_count: i64,
    #[serde(default)]
    pub promotion_count: i64,
    #[serde(default)]
    pub tier_promoted_at: Option<DateTime<Utc>>,
    pub last_referenced_at: DateTime<Utc>,
    #[serde(default)]
    pub source_agent_id: Option<String>,
    #[serde(default)]
    pub shared_with_agents: HashSet<String>,
    #[serde(default)]
    pub handoff_id: Option<String>,
}

fn default_importance() -> f64 {
    0.5
}

fn default_tier() -> MemoryTier {
    MemoryTier::Conversation
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEmbedding {
    pub message_id: i64,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    Sequential,
    Parallel,
    Fork,
    Join,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStatus {
    Pending,
    Applied,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: i64,
    pub session_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub handoff_id: String,
    pub handoff_context: String,
    pub handoff_type: HandoffType,
    pub status: CollaborationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Manual,
    Automatic,
    Workflow,
    Milestone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    pub session_id: String,
    pub checkpoint_id: String,
    pub checkpoint_type: CheckpointType,
    pub memory_snapshot: serde_json::Value,
    pub entity_snapshot: serde_json::Value,
    pub agents_involved: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resume_count: i64,
    #[serde(default)]
    pub last_resumed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from_session_id: String,
    pub to_session_id: String,
    pub summary: String,
    pub context_preserved: serde_json::Value,
    pub handoff_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    None,
    Warn,
    Compress,
    Summarize,
    Handoff,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_serde_roundtrip() {
        let json = serde_json::to_string(&SessionStatus::Archived).unwrap();
        assert_eq!(json, "\"archived\"");
        let back: SessionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SessionStatus::Archived);
    }

    #[test]
    fn tier_priority_orders_project_highest() {
        assert!(MemoryTier::Project.priority() > MemoryTier::Agent.priority());
        assert!(MemoryTier::Agent.priority() > MemoryTier::Conversation.priority());
    }

    #[test]
    fn tier_next_is_monotone_and_terminal_at_project() {
        assert_eq!(MemoryTier::Conversation.next(), Some(MemoryTier::Agent));
        assert_eq!(MemoryTier::Agent.next(), Some(MemoryTier::Project));
        assert_eq!(MemoryTier::Project.next(), None);
    }

    #[test]
    fn message_defaults_apply_on_deserialize() {
        let json = serde_json::json!({
            "id": 1,
            "conversation_id": 1,
            "role": "user",
            "content": "hi",
            "created_at": Utc::now().to_rfc3339(),
            "last_referenced_at": Utc::now().to_rfc3339(),
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.tier, MemoryTier::Conversation);
        assert_eq!(msg.importance_score, 0.5);
        assert!(!msg.is_summarized);
    }

    #[test]
    fn message_role_wire_values() {
        assert_eq!(serde_json::to_string(&MessageRole::Tool).unwrap(), "\"tool\"");
    }
}
