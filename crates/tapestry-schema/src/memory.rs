use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MemoryTier;

/// Context passed by the host into `inject_enhanced_memory`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalContext {
    pub session_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub current_tokens: i64,
    #[serde(default)]
    pub token_budget: Option<i64>,
    /// Known tool-parameter fields, checked in order when `query` is absent.
    #[serde(default)]
    pub tool_params: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSource {
    pub message_id: i64,
    pub tier: MemoryTier,
    pub score: f64,
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InjectionResult {
    #[serde(default)]
    pub payload: Option<String>,
    pub tokens_used: i64,
    #[serde(default)]
    pub sources: Vec<ScoredSource>,
    #[serde(default)]
    pub scores: HashMap<i64, f64>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl InjectionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Weights for the multi-factor retrieval scorer (§4.H).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub semantic: f64,
    pub recency: f64,
    pub tier: f64,
    pub entity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            recency: 0.2,
            tier: 0.3,
            entity: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    pub conversation_to_agent: i64,
    pub agent_to_project: i64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            conversation_to_agent: 3,
            agent_to_project: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OverflowThresholds {
    pub warning: f64,
    pub compress: f64,
    pub summarize: f64,
    pub handoff: f64,
}

impl Default for OverflowThresholds {
    fn default() -> Self {
        Self {
            warning: 0.85,
            compress: 0.90,
            summarize: 0.93,
            handoff: 0.97,
        }
    }
}

pub const fn duration_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_score_weights_sum_to_one() {
        let w = ScoreWeights::default();
        let total = w.semantic + w.recency + w.tier + w.entity;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overflow_thresholds_are_increasing() {
        let t = OverflowThresholds::default();
        assert!(t.warning < t.compress);
        assert!(t.compress < t.summarize);
        assert!(t.summarize < t.handoff);
    }
}
