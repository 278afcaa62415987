use serde::{Deserialize, Serialize};

use crate::{OverflowThresholds, ScoreWeights, TierThresholds};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(flatten)]
    pub thresholds: TierThresholds,
    #[serde(default = "default_conversation_ttl_hours")]
    pub conversation_ttl_hours: i64,
    #[serde(default = "default_agent_ttl_hours")]
    pub agent_ttl_hours: i64,
    /// `None` means project-tier memories never expire.
    #[serde(default)]
    pub project_ttl_hours: Option<i64>,
}

fn default_conversation_ttl_hours() -> i64 {
    24
}

fn default_agent_ttl_hours() -> i64 {
    168
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            conversation_ttl_hours: default_conversation_ttl_hours(),
            agent_ttl_hours: default_agent_ttl_hours(),
            project_ttl_hours: None,
        }
    }
}

/// Process-wide switch between the legacy scoring path and the four-factor one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Legacy: recency + type-weighted similarity + cost heuristic.
    Basic,
    /// `0.4*semantic + 0.2*recency + 0.3*tier + 0.1*entity_overlap`.
    #[default]
    Enhanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default = "default_token_budget_ratio")]
    pub token_budget_ratio: f64,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: i64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default = "default_scoring_timeout_ms")]
    pub scoring_timeout_ms: u64,
    #[serde(default = "default_injection_timeout_ms")]
    pub injection_timeout_ms: u64,
}

fn default_token_budget_ratio() -> f64 {
    0.2
}
fn default_min_tokens() -> i64 {
    1000
}
fn default_max_tokens() -> i64 {
    40_000
}
fn default_min_relevance() -> f64 {
    0.5
}
fn default_scoring_timeout_ms() -> u64 {
    100
}
fn default_injection_timeout_ms() -> u64 {
    500
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::default(),
            weights: ScoreWeights::default(),
            token_budget_ratio: default_token_budget_ratio(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            min_relevance: default_min_relevance(),
            scoring_timeout_ms: default_scoring_timeout_ms(),
            injection_timeout_ms: default_injection_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationConfig {
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,
    #[serde(default = "default_circular_detection_depth")]
    pub circular_detection_depth: usize,
    #[serde(default = "default_handoff_ttl_ms")]
    pub handoff_ttl_ms: u64,
    #[serde(default = "default_true_bool")]
    pub block_circular_handoffs: bool,
    #[serde(default = "default_max_circular_violations")]
    pub max_circular_violations: u32,
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,
}

fn default_max_chain_length() -> usize {
    10
}
fn default_circular_detection_depth() -> usize {
    5
}
fn default_handoff_ttl_ms() -> u64 {
    3_600_000
}
fn default_true_bool() -> bool {
    true
}
fn default_max_circular_violations() -> u32 {
    3
}
fn default_circuit_breaker_cooldown_ms() -> u64 {
    300_000
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            max_chain_length: default_max_chain_length(),
            circular_detection_depth: default_circular_detection_depth(),
            handoff_ttl_ms: default_handoff_ttl_ms(),
            block_circular_handoffs: default_true_bool(),
            max_circular_violations: default_max_circular_violations(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    #[serde(default = "default_message_ttl_days")]
    pub message_ttl_days: i64,
    #[serde(default = "default_vector_ttl_days")]
    pub vector_ttl_days: i64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub run_interval_ms: u64,
}

fn default_session_ttl_days() -> i64 {
    30
}
fn default_message_ttl_days() -> i64 {
    90
}
fn default_vector_ttl_days() -> i64 {
    180
}
fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            session_ttl_days: default_session_ttl_days(),
            message_ttl_days: default_message_ttl_days(),
            vector_ttl_days: default_vector_ttl_days(),
            run_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_indexer_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_indexer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true_bool")]
    pub auto_start: bool,
}

fn default_indexer_interval_ms() -> u64 {
    60_000
}
fn default_indexer_batch_size() -> usize {
    100
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_indexer_interval_ms(),
            batch_size: default_indexer_batch_size(),
            auto_start: default_true_bool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub overflow: OverflowThresholds,
    #[serde(default)]
    pub collaboration: CollaborationConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects ambiguous or out-of-range values before the engine opens its store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.retrieval.weights;
        let sum = w.semantic + w.recency + w.tier + w.entity;
        if (sum - 1.0).abs() > 0.01 {
            return Err(ConfigError::Invalid(format!(
                "retrieval.weights must sum to ~1.0, got {sum}"
            )));
        }
        let t = &self.overflow;
        if !(t.warning < t.compress && t.compress < t.summarize && t.summarize < t.handoff) {
            return Err(ConfigError::Invalid(
                "overflow thresholds must be strictly increasing".into(),
            ));
        }
        if self.retrieval.min_tokens > self.retrieval.max_tokens {
            return Err(ConfigError::Invalid(
                "retrieval.min_tokens must not exceed retrieval.max_tokens".into(),
            ));
        }
        if self.cleanup.session_ttl_days <= 0
            || self.cleanup.message_ttl_days <= 0
            || self.cleanup.vector_ttl_days <= 0
        {
            return Err(ConfigError::Invalid(
                "cleanup TTLs are denominated in days and must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_increasing_overflow_thresholds() {
        let mut cfg = EngineConfig::default();
        cfg.overflow.compress = 0.97;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut cfg = EngineConfig::default();
        cfg.retrieval.weights.semantic = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_yaml_applies_defaults_for_missing_sections() {
        let cfg = EngineConfig::from_yaml("tiers:\n  conversation_to_agent: 4\n").unwrap();
        assert_eq!(cfg.tiers.thresholds.conversation_to_agent, 4);
        assert_eq!(cfg.tiers.thresholds.agent_to_project, 5);
    }
}
