use chrono::Utc;
use rusqlite::params;
use tapestry_schema::LearnedPattern;
use tokio::task;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

fn growth_rate(total_count: i64) -> f64 {
    if total_count < 5 {
        0.10
    } else if total_count < 10 {
        0.05
    } else if total_count < 50 {
        0.02
    } else {
        0.01
    }
}

/// Deterministic key derivation for a pattern occurrence.
pub fn derive_key(pattern_type: &str, data: &serde_json::Value) -> String {
    match pattern_type {
        "workflow" => {
            if let Some(seq) = data.get("sequence").and_then(|v| v.as_array()) {
                let joined = seq
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join("->");
                return format!("workflow:{joined}");
            }
            format!("workflow:{}", hash_fallback(data))
        }
        other => format!("{other}:{}", hash_fallback(data)),
    }
}

fn hash_fallback(data: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    hasher.finalize()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl Store {
    /// Records (or reinforces) a learned pattern occurrence.
    pub async fn record_pattern(
        &self,
        pattern_type: &str,
        data: serde_json::Value,
        increment: i64,
    ) -> EngineResult<LearnedPattern> {
        let key = derive_key(pattern_type, &data);
        let pattern_type = pattern_type.to_string();
        self.transaction(move |tx| {
            let now = Utc::now().to_rfc3339();

            let existing: Option<(i64, f64)> = tx
                .query_row(
                    "SELECT occurrence_count, confidence FROM learned_patterns \
                     WHERE pattern_type = ?1 AND pattern_key = ?2",
                    params![pattern_type, key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .ok();

            if let Some((count, confidence)) = existing {
                let new_count = count + increment;
                let new_confidence =
                    (confidence + (1.0 - confidence) * growth_rate(new_count) * increment as f64).min(0.99);
                tx.execute(
                    "UPDATE learned_patterns SET occurrence_count = ?1, confidence = ?2, last_seen = ?3 \
                     WHERE pattern_type = ?4 AND pattern_key = ?5",
                    params![new_count, new_confidence, now, pattern_type, key],
                )
                .map_err(EngineError::from)?;
            } else {
                tx.execute(
                    "INSERT INTO learned_patterns (pattern_type, pattern_key, pattern_value, \
                     occurrence_count, confidence, first_seen, last_seen) VALUES (?1, ?2, ?3, ?4, 0.10, ?5, ?5)",
                    params![pattern_type, key, data.to_string(), increment, now],
                )
                .map_err(EngineError::from)?;
            }

            tx_get_pattern(tx, &pattern_type, &key)
        })
        .await
    }

    pub async fn query_patterns(&self, pattern_type: Option<String>, min_confidence: f64) -> EngineResult<Vec<LearnedPattern>> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let sql = match &pattern_type {
                Some(_) => "SELECT * FROM learned_patterns WHERE pattern_type = ?1 AND confidence >= ?2 \
                            ORDER BY confidence DESC",
                None => "SELECT * FROM learned_patterns WHERE confidence >= ?2 ORDER BY confidence DESC",
            };
            let mut stmt = conn.prepare(sql).map_err(EngineError::from)?;
            let rows = if let Some(t) = &pattern_type {
                stmt.query_map(params![t, min_confidence], row_to_pattern)
            } else {
                stmt.query_map(params![0, min_confidence], row_to_pattern)
            }
            .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Removes stale low-confidence patterns as part of a cleanup sweep.
    pub async fn prune_patterns(&self, confidence_floor: f64, stale_days: i64) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let cutoff = (Utc::now() - chrono::Duration::days(stale_days)).to_rfc3339();
            let deleted = conn
                .execute(
                    "DELETE FROM learned_patterns WHERE confidence < ?1 AND last_seen < ?2",
                    params![confidence_floor, cutoff],
                )
                .map_err(EngineError::from)?;
            Ok(deleted as i64)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

fn tx_get_pattern(conn: &rusqlite::Connection, pattern_type: &str, key: &str) -> EngineResult<LearnedPattern> {
    conn.query_row(
        "SELECT * FROM learned_patterns WHERE pattern_type = ?1 AND pattern_key = ?2",
        params![pattern_type, key],
        row_to_pattern,
    )
    .map_err(EngineError::from)
}

fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<LearnedPattern> {
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;
    let value_raw: String = row.get("pattern_value")?;
    Ok(LearnedPattern {
        pattern_type: row.get("pattern_type")?,
        pattern_key: row.get("pattern_key")?,
        pattern_value: serde_json::from_str(&value_raw).unwrap_or(serde_json::Value::Null),
        occurrence_count: row.get("occurrence_count")?,
        confidence: row.get("confidence")?,
        first_seen: first_seen.parse().unwrap_or_else(|_| Utc::now()),
        last_seen: last_seen.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn recording_a_pattern_twice_never_decreases_confidence_or_count() {
        let store = Store::open_in_memory().unwrap();
        let data = json!({"sequence": ["read", "edit", "test"]});
        let first = store.record_pattern("workflow", data.clone(), 1).await.unwrap();
        let second = store.record_pattern("workflow", data, 1).await.unwrap();
        assert!(second.occurrence_count >= first.occurrence_count);
        assert!(second.confidence >= first.confidence);
    }

    #[tokio::test]
    async fn derive_key_is_deterministic() {
        let data = json!({"sequence": ["a", "b"]});
        assert_eq!(derive_key("workflow", &data), derive_key("workflow", &data));
    }
}
