use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    pub confidence: f64,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "default_occurrence")]
    pub occurrence_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub last_updated_by_agent: Option<String>,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default)]
    pub merge_count: i64,
}

fn default_occurrence() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_version() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAttribute {
    pub entity_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub entity_id_1: String,
    pub entity_id_2: String,
    pub relationship_type: String,
    pub strength: f64,
}

/// Strategy used when `get_global_entity` finds a similar-but-not-identical candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    NewestWins,
    HighestConfidence,
    MergeContext,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern_type: String,
    pub pattern_key: String,
    pub pattern_value: serde_json::Value,
    #[serde(default = "default_occurrence")]
    pub occurrence_count: i64,
    #[serde(default = "default_initial_confidence")]
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

fn default_initial_confidence() -> f64 {
    0.10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_strategy_wire_values() {
        assert_eq!(
            serde_json::to_string(&MergeStrategy::MergeContext).unwrap(),
            "\"merge_context\""
        );
    }

    #[test]
    fn entity_roundtrips_through_json() {
        let now = Utc::now();
        let e = Entity {
            id: "e1".into(),
            entity_type: "tool".into(),
            value: "TypeScript".into(),
            confidence: 0.9,
            context: None,
            metadata: HashMap::new(),
            occurrence_count: 1,
            first_seen: now,
            last_seen: now,
            is_active: true,
            is_global: true,
            last_updated_by_agent: Some("agent-a".into()),
            version: 1,
            merge_count: 0,
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, "TypeScript");
        assert_eq!(back.entity_type, "tool");
    }
}
