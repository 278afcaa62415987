use std::collections::HashSet;

use rusqlite::Connection;

use crate::error::{EngineError, EngineResult};

const VECTOR_DIM: usize = 1536;

fn migrations() -> Vec<(i64, String)> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                project_id TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                title TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                summary TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER,
                created_at TEXT NOT NULL,
                importance_score REAL NOT NULL DEFAULT 0.5,
                is_summarized INTEGER NOT NULL DEFAULT 0,
                original_content TEXT,
                tier TEXT NOT NULL DEFAULT 'conversation',
                agent_id TEXT,
                reference_count INTEGER NOT NULL DEFAULT 0,
                promotion_count INTEGER NOT NULL DEFAULT 0,
                tier_promoted_at TEXT,
                last_referenced_at TEXT NOT NULL,
                source_agent_id TEXT,
                shared_with_agents TEXT NOT NULL DEFAULT '[]',
                handoff_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_tier ON messages(tier, agent_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at DESC, id DESC);

            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                content,
                content='messages',
                content_rowid='id',
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
            END;
            CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.id, old.content);
            END;
            CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.id, old.content);
                INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
            END;
            "#
            .to_string(),
        ),
        (
            2,
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS message_embeddings (
                message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
                model_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                vector BLOB NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS message_vectors USING vec0(
                message_id INTEGER PRIMARY KEY,
                embedding FLOAT[{VECTOR_DIM}]
            );

            CREATE TABLE IF NOT EXISTS embedding_cache (
                content_hash TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                vector BLOB NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            );
            "#
            ),
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                value TEXT NOT NULL,
                confidence REAL NOT NULL,
                context TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_global INTEGER NOT NULL DEFAULT 0,
                last_updated_by_agent TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                merge_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_global_identity
                ON entities(entity_type, value) WHERE is_global = 1 AND is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_entities_type_value ON entities(entity_type, value);

            CREATE TABLE IF NOT EXISTS entity_attributes (
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (entity_id, key)
            );

            CREATE TABLE IF NOT EXISTS entity_relationships (
                entity_id_1 TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                entity_id_2 TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                relationship_type TEXT NOT NULL,
                strength REAL NOT NULL DEFAULT 1.0,
                PRIMARY KEY (entity_id_1, entity_id_2, relationship_type)
            );
            "#
            .to_string(),
        ),
        (
            4,
            r#"
            CREATE TABLE IF NOT EXISTS learned_patterns (
                pattern_type TEXT NOT NULL,
                pattern_key TEXT NOT NULL,
                pattern_value TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                confidence REAL NOT NULL DEFAULT 0.10,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (pattern_type, pattern_key)
            );
            "#
            .to_string(),
        ),
        (
            5,
            r#"
            CREATE TABLE IF NOT EXISTS agent_collaborations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                workflow_id TEXT,
                source_agent_id TEXT NOT NULL,
                target_agent_id TEXT NOT NULL,
                handoff_id TEXT NOT NULL UNIQUE,
                handoff_context TEXT NOT NULL,
                handoff_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                applied_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_collab_session ON agent_collaborations(session_id, created_at DESC, id DESC);

            CREATE TABLE IF NOT EXISTS session_resume_checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                checkpoint_type TEXT NOT NULL,
                memory_snapshot TEXT NOT NULL,
                entity_snapshot TEXT NOT NULL,
                agents_involved TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                resume_count INTEGER NOT NULL DEFAULT 0,
                last_resumed_at TEXT,
                is_archived INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON session_resume_checkpoints(session_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS session_handoffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_session_id TEXT NOT NULL,
                to_session_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                context_preserved TEXT NOT NULL,
                handoff_reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#
            .to_string(),
        ),
        (
            6,
            r#"
            CREATE TABLE IF NOT EXISTS cleanup_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ran_at TEXT NOT NULL,
                sessions_deleted INTEGER NOT NULL DEFAULT 0,
                messages_truncated INTEGER NOT NULL DEFAULT 0,
                vectors_deleted INTEGER NOT NULL DEFAULT 0,
                bytes_reclaimed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS memory_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                interaction_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routing_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                chosen_agent_id TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cost_tracking (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            );

            CREATE VIEW IF NOT EXISTS v_active_sessions AS
                SELECT * FROM sessions WHERE status = 'active';

            CREATE VIEW IF NOT EXISTS v_recent_agent_activity AS
                SELECT agent_id, session_id, created_at FROM agent_interactions
                ORDER BY created_at DESC;
            "#
            .to_string(),
        ),
    ]
}

/// Applies pending migrations, each in its own transaction. A failing migration
/// rolls back cleanly; already-applied versions are skipped so re-opening is a no-op.
pub fn run_migrations(conn: &mut Connection) -> EngineResult<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __memory_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )
    .map_err(EngineError::from)?;

    let applied: HashSet<i64> = {
        let mut stmt = conn
            .prepare("SELECT version FROM __memory_schema_version")
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(EngineError::from)?;
        rows.filter_map(|r| r.ok()).collect()
    };

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }
        let tx = conn.unchecked_transaction().map_err(EngineError::from)?;
        tx.execute_batch(&sql).map_err(EngineError::from)?;
        tx.execute(
            "INSERT INTO __memory_schema_version(version) VALUES (?1)",
            [version],
        )
        .map_err(EngineError::from)?;
        tx.commit().map_err(EngineError::from)?;
    }

    Ok(())
}

pub const fn vector_dim() -> usize {
    VECTOR_DIM
}
