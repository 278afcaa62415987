use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use rusqlite::params;
use tapestry_schema::{Entity, EntityRelationship, MergeStrategy};
use tokio::task;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub entity_type: String,
    pub value: String,
    pub confidence: f64,
    pub context: String,
    pub source: ExtractionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Text,
    Json,
}

struct Pattern {
    entity_type: &'static str,
    regex: Regex,
    base_confidence: f64,
}

static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();

const KNOWN_TOOLS: &[&str] = &[
    "git", "npm", "cargo", "docker", "kubectl", "terraform", "make", "python", "node", "rustc",
];

fn patterns() -> &'static Vec<Pattern> {
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                entity_type: "tool",
                regex: Regex::new(&format!(r"(?i)\b({})\b", KNOWN_TOOLS.join("|"))).unwrap(),
                base_confidence: 0.5,
            },
            Pattern {
                entity_type: "person",
                regex: Regex::new(r"@([A-Za-z0-9_-]{2,39})\b").unwrap(),
                base_confidence: 0.4,
            },
            Pattern {
                entity_type: "project",
                regex: Regex::new(r"\b([A-Za-z0-9_-]+)/([A-Za-z0-9_.-]+)\b").unwrap(),
                base_confidence: 0.4,
            },
            Pattern {
                entity_type: "person",
                regex: Regex::new(r"\b([A-Z][a-z]+(?: [A-Z][a-z]+)+)\b").unwrap(),
                base_confidence: 0.35,
            },
        ]
    })
}

fn context_window(text: &str, start: usize, end: usize) -> String {
    let lo = start.saturating_sub(50);
    let hi = (end + 50).min(text.len());
    text.get(lo..hi).unwrap_or(text).to_string()
}

fn adjust_confidence(entity_type: &str, value: &str, base: f64) -> f64 {
    let mut c = base;
    if entity_type == "tool" && KNOWN_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(value)) {
        c += 0.3;
    }
    if entity_type == "person" && value.starts_with('@') {
        c += 0.25;
    }
    if entity_type == "project" && value.contains('/') {
        c += 0.2;
    }
    if entity_type == "person" && value.split_whitespace().count() > 1 {
        c += 0.15;
    }
    if value.len() < 3 {
        c *= 0.6;
    } else if value.len() > 50 {
        c *= 0.7;
    }
    c.clamp(0.0, 1.0)
}

/// Pattern-based fallback when no listed pattern matched a candidate span.
pub fn classify_entity(value: &str) -> (&'static str, f64) {
    if value.contains('/') && value.split('/').count() == 2 {
        return ("project", 0.5);
    }
    if KNOWN_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(value)) {
        return ("tool", 1.0);
    }
    if value.starts_with('@') {
        return ("tool", 0.4);
    }
    if value.contains('.') && value.matches('.').count() == 1 && !value.contains(' ') {
        return ("artifact", 0.5);
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return ("artifact", 0.5);
    }
    if value.chars().next().is_some_and(|c| c.is_uppercase())
        && value.split_whitespace().count() > 1
    {
        return ("person", 0.4);
    }
    if value.ends_with("Inc") || value.ends_with("Corp") || value.ends_with("LLC") {
        return ("organization", 0.4);
    }
    if ["decided", "decision", "chose", "agreed"]
        .iter()
        .any(|k| value.to_lowercase().contains(k))
    {
        return ("decision", 0.4);
    }
    ("artifact", 0.4)
}

/// Extracts a deduplicated sequence of candidate entities from free text.
pub fn extract_from_text(text: &str) -> Vec<ExtractedEntity> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for pattern in patterns() {
        for m in pattern.regex.find_iter(text) {
            let value = m.as_str().trim_start_matches('@').to_string();
            let key = (pattern.entity_type, value.clone());
            if !seen.insert(key) {
                continue;
            }
            out.push(ExtractedEntity {
                entity_type: pattern.entity_type.to_string(),
                value,
                confidence: adjust_confidence(pattern.entity_type, m.as_str(), pattern.base_confidence),
                context: context_window(text, m.start(), m.end()),
                source: ExtractionSource::Text,
            });
        }
    }
    out
}

const JSON_KEY_TYPES: &[(&str, &str)] = &[
    ("author", "person"),
    ("user", "person"),
    ("assignee", "person"),
    ("repo", "project"),
    ("repository", "project"),
    ("project", "project"),
    ("tool", "tool"),
    ("command", "tool"),
    ("file", "artifact"),
    ("path", "artifact"),
    ("decision", "decision"),
];

/// Walks a JSON value recursively, classifying leaves by their parent key.
pub fn extract_from_json(value: &serde_json::Value) -> Vec<ExtractedEntity> {
    let mut out = Vec::new();
    walk_json(value, None, &mut out);
    out
}

fn walk_json(value: &serde_json::Value, parent_key: Option<&str>, out: &mut Vec<ExtractedEntity>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                walk_json(v, Some(key), out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_json(item, parent_key, out);
            }
        }
        serde_json::Value::String(s) if !s.is_empty() => {
            let entity_type = parent_key
                .and_then(|k| JSON_KEY_TYPES.iter().find(|(jk, _)| *jk == k.to_lowercase()))
                .map(|(_, t)| *t);
            if let Some(entity_type) = entity_type {
                out.push(ExtractedEntity {
                    entity_type: entity_type.to_string(),
                    value: s.clone(),
                    confidence: 0.6,
                    context: parent_key.unwrap_or_default().to_string(),
                    source: ExtractionSource::Json,
                });
            }
        }
        _ => {}
    }
}

/// Normalized Levenshtein similarity in [0, 1]; 1.0 means identical strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    let distance = levenshtein(&a, &b);
    let max_len = a.chars().count().max(b.chars().count()).max(1);
    1.0 - (distance as f64 / max_len as f64)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut prev = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let tmp = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev
            } else {
                1 + prev.min(row[j]).min(row[j - 1])
            };
            prev = tmp;
        }
    }
    row[b.len()]
}

impl Store {
    pub async fn create_entity(
        &self,
        entity_type: &str,
        value: &str,
        context: Option<String>,
        confidence: f64,
        is_global: bool,
        updated_by_agent: Option<String>,
    ) -> EngineResult<Entity> {
        let db = self.conn();
        let entity_type = entity_type.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let tx = conn.transaction().map_err(EngineError::from)?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM entities WHERE entity_type = ?1 AND value = ?2 AND is_active = 1",
                    params![entity_type, value],
                    |r| r.get(0),
                )
                .ok();
            let id = if let Some(id) = existing {
                tx.execute(
                    "UPDATE entities SET occurrence_count = occurrence_count + 1, last_seen = ?1 WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), id],
                )
                .map_err(EngineError::from)?;
                id
            } else {
                let id = Uuid::new_v4().to_string();
                let now = Utc::now();
                tx.execute(
                    r#"INSERT INTO entities (
                        id, entity_type, value, confidence, context, metadata, occurrence_count,
                        first_seen, last_seen, is_active, is_global, last_updated_by_agent, version, merge_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, '{}', 1, ?6, ?6, 1, ?7, ?8, 1, 0)"#,
                    params![
                        id,
                        entity_type,
                        value,
                        confidence,
                        context,
                        now.to_rfc3339(),
                        is_global,
                        updated_by_agent,
                    ],
                )
                .map_err(EngineError::from)?;
                id
            };

            tx.commit().map_err(EngineError::from)?;
            fetch_entity(&conn, &id)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn add_entity_attribute(&self, entity_id: &str, key: &str, value: &str) -> EngineResult<()> {
        let db = self.conn();
        let (entity_id, key, value) = (entity_id.to_string(), key.to_string(), value.to_string());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "INSERT INTO entity_attributes (entity_id, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity_id, key) DO UPDATE SET value = excluded.value",
                params![entity_id, key, value],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn add_entity_relationship(&self, rel: EntityRelationship) -> EngineResult<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "INSERT INTO entity_relationships (entity_id_1, entity_id_2, relationship_type, strength) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(entity_id_1, entity_id_2, relationship_type) \
                 DO UPDATE SET strength = strength + excluded.strength",
                params![rel.entity_id_1, rel.entity_id_2, rel.relationship_type, rel.strength],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn search_entities(&self, query: &str, entity_type: Option<String>, limit: i64) -> EngineResult<Vec<Entity>> {
        let db = self.conn();
        let query = format!("%{query}%");
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let sql = match &entity_type {
                Some(_) => "SELECT * FROM entities WHERE value LIKE ?1 AND entity_type = ?2 AND is_active = 1 \
                            ORDER BY occurrence_count DESC, last_seen DESC LIMIT ?3",
                None => "SELECT * FROM entities WHERE value LIKE ?1 AND is_active = 1 \
                         ORDER BY occurrence_count DESC, last_seen DESC LIMIT ?3",
            };
            let mut stmt = conn.prepare(sql).map_err(EngineError::from)?;
            let rows = if let Some(t) = &entity_type {
                stmt.query_map(params![query, t, limit], row_to_entity)
            } else {
                stmt.query_map(params![query, limit], row_to_entity)
            }
            .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Implements §4.D's shared registry lookup-or-create-or-merge.
    pub async fn get_global_entity(
        &self,
        entity_type: &str,
        value: &str,
        agent_id: &str,
        similarity_threshold: f64,
        strategy: MergeStrategy,
        max_context_length: usize,
    ) -> EngineResult<Entity> {
        let db = self.conn();
        let (entity_type, value, agent_id) = (entity_type.to_string(), value.to_string(), agent_id.to_string());
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let tx = conn.transaction().map_err(EngineError::from)?;

            let exact: Option<String> = tx
                .query_row(
                    "SELECT id FROM entities WHERE entity_type = ?1 AND value = ?2 AND is_global = 1 AND is_active = 1",
                    params![entity_type, value],
                    |r| r.get(0),
                )
                .ok();
            if let Some(id) = exact {
                let existing = fetch_entity(&tx, &id)?;
                if existing.last_updated_by_agent.as_deref() != Some(agent_id.as_str()) {
                    tx.execute(
                        "UPDATE entities SET version = version + 1, merge_count = merge_count + 1, \
                         last_updated_by_agent = ?1, last_seen = ?2 WHERE id = ?3",
                        params![agent_id, Utc::now().to_rfc3339(), id],
                    )
                    .map_err(EngineError::from)?;
                }
                let result = fetch_entity(&tx, &id);
                tx.commit().map_err(EngineError::from)?;
                return result;
            }

            let mut stmt = tx
                .prepare("SELECT * FROM entities WHERE entity_type = ?1 AND is_global = 1 AND is_active = 1")
                .map_err(EngineError::from)?;
            let candidates: Vec<Entity> = stmt
                .query_map([&entity_type], row_to_entity)
                .map_err(EngineError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(EngineError::from)?;
            drop(stmt);

            let best = candidates
                .into_iter()
                .map(|e| {
                    let s = similarity(&e.value, &value);
                    (e, s)
                })
                .filter(|(_, s)| *s >= similarity_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            if let Some((existing, _)) = best {
                let result = merge_entity(&tx, existing, &value, &agent_id, strategy, max_context_length);
                tx.commit().map_err(EngineError::from)?;
                return result;
            }

            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            tx.execute(
                r#"INSERT INTO entities (
                    id, entity_type, value, confidence, context, metadata, occurrence_count,
                    first_seen, last_seen, is_active, is_global, last_updated_by_agent, version, merge_count
                ) VALUES (?1, ?2, ?3, 0.6, NULL, '{}', 1, ?4, ?4, 1, 1, ?5, 1, 0)"#,
                params![id, entity_type, value, now.to_rfc3339(), agent_id],
            )
            .map_err(EngineError::from)?;
            let result = fetch_entity(&tx, &id);
            tx.commit().map_err(EngineError::from)?;
            result
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

fn merge_entity(
    conn: &rusqlite::Connection,
    existing: Entity,
    new_value: &str,
    agent_id: &str,
    strategy: MergeStrategy,
    max_context_length: usize,
) -> EngineResult<Entity> {
    let merged_context = match strategy {
        MergeStrategy::NewestWins => Some(new_value.to_string()),
        MergeStrategy::HighestConfidence => existing.context.clone(),
        MergeStrategy::MergeContext | MergeStrategy::Manual => {
            let mut parts: Vec<String> = existing.context.clone().into_iter().collect();
            if !parts.iter().any(|p| p == new_value) {
                parts.push(new_value.to_string());
            }
            let joined = parts.join(" | ");
            Some(joined.chars().take(max_context_length).collect())
        }
    };
    conn.execute(
        "UPDATE entities SET version = version + 1, merge_count = merge_count + 1, \
         last_updated_by_agent = ?1, last_seen = ?2, context = ?3 WHERE id = ?4",
        params![agent_id, Utc::now().to_rfc3339(), merged_context, existing.id],
    )
    .map_err(EngineError::from)?;
    fetch_entity(conn, &existing.id)
}

fn fetch_entity(conn: &rusqlite::Connection, id: &str) -> EngineResult<Entity> {
    conn.query_row("SELECT * FROM entities WHERE id = ?1", [id], row_to_entity)
        .map_err(EngineError::from)
}

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let metadata_raw: String = row.get("metadata")?;
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;
    Ok(Entity {
        id: row.get("id")?,
        entity_type: row.get("entity_type")?,
        value: row.get("value")?,
        confidence: row.get("confidence")?,
        context: row.get("context")?,
        metadata: serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata_raw).unwrap_or_default(),
        occurrence_count: row.get("occurrence_count")?,
        first_seen: first_seen.parse().unwrap_or_else(|_| Utc::now()),
        last_seen: last_seen.parse().unwrap_or_else(|_| Utc::now()),
        is_active: row.get("is_active")?,
        is_global: row.get("is_global")?,
        last_updated_by_agent: row.get("last_updated_by_agent")?,
        version: row.get("version")?,
        merge_count: row.get("merge_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_known_tool_with_boosted_confidence() {
        let found = extract_from_text("please run cargo build");
        assert!(found.iter().any(|e| e.entity_type == "tool" && e.value.eq_ignore_ascii_case("cargo")));
    }

    #[test]
    fn extracts_project_shape() {
        let found = extract_from_text("see anthropics/claude-code for details");
        assert!(found.iter().any(|e| e.entity_type == "project"));
    }

    #[test]
    fn classify_falls_back_to_artifact() {
        let (t, _) = classify_entity("random_blob_9f8a");
        assert_eq!(t, "artifact");
    }

    #[test]
    fn similarity_of_identical_strings_is_one() {
        assert_eq!(similarity("TypeScript", "TypeScript"), 1.0);
    }

    #[test]
    fn similarity_of_near_matches_is_high() {
        assert!(similarity("TypeScript", "Typescript") > 0.85);
    }

    #[tokio::test]
    async fn create_entity_is_idempotent_on_type_and_value() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_entity("tool", "git", None, 0.9, false, None).await.unwrap();
        let b = store.create_entity("tool", "git", None, 0.9, false, None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.occurrence_count, 2);
    }

    #[tokio::test]
    async fn global_entity_merge_bumps_version_and_merge_count() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .get_global_entity("tool", "TypeScript", "agent-a", 0.85, MergeStrategy::MergeContext, 500)
            .await
            .unwrap();
        let b = store
            .get_global_entity("tool", "TypeScript", "agent-b", 0.85, MergeStrategy::MergeContext, 500)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.version, 2);
        assert_eq!(b.merge_count, 1);
        assert_eq!(b.last_updated_by_agent.as_deref(), Some("agent-b"));
    }
}
