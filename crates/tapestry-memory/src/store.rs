use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tapestry_schema::{Conversation, Message, MemoryTier, MessageRole, Session, SessionStatus};
use tokio::task;

use crate::error::{EngineError, EngineResult};
use crate::migrations::run_migrations;

/// Columns retrieval callers may sort by. Anything else is rejected with
/// `InvalidSortColumn` rather than interpolated into SQL.
pub const SORTABLE_COLUMNS: &[&str] = &["created_at", "id", "importance_score", "last_referenced_at"];

pub fn validate_sort_column(column: &str) -> EngineResult<&'static str> {
    SORTABLE_COLUMNS
        .iter()
        .find(|c| **c == column)
        .copied()
        .ok_or_else(|| EngineError::InvalidSortColumn(column.to_string()))
}

/// Registers the sqlite-vec extension. Must run before any `Connection::open` call.
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> EngineResult<Self> {
        init_sqlite_vec();
        let mut conn = Connection::open(path).map_err(|e| {
            EngineError::StoreOpenError(format!("opening {path}: {e}"))
        })?;
        Self::configure(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        init_sqlite_vec();
        let mut conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StoreOpenError(e.to_string()))?;
        Self::configure(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &mut Connection) -> EngineResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(EngineError::from)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(EngineError::from)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(EngineError::from)?;
        conn.pragma_update(None, "page_size", 4096)
            .map_err(EngineError::from)?;
        conn.pragma_update(None, "cache_size", -10_000)
            .map_err(EngineError::from)?;
        conn.pragma_update(None, "mmap_size", 128 * 1024 * 1024)
            .map_err(EngineError::from)?;
        run_migrations(conn)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))
    }

    /// Runs `f` inside an exclusive writer transaction with deferred foreign-key
    /// checks. Any error returned from `f` rolls the transaction back.
    pub async fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> EngineResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.conn();
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let tx = conn.transaction().map_err(EngineError::from)?;
            tx.pragma_update(None, "defer_foreign_keys", true).map_err(EngineError::from)?;
            let result = f(&tx)?;
            tx.commit().map_err(EngineError::from)?;
            Ok(result)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn vacuum(&self) -> EngineResult<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute_batch("VACUUM;").map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    /// Appends one sample to the `memory_metrics` table (scoring/injection latency, etc).
    pub async fn record_metric(&self, metric: &str, value: f64) -> EngineResult<()> {
        let db = self.conn();
        let metric = metric.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "INSERT INTO memory_metrics (recorded_at, metric, value) VALUES (?1, ?2, ?3)",
                params![Utc::now().to_rfc3339(), metric, value],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    // ---- sessions ----

    pub async fn create_session(&self, session: Session) -> EngineResult<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                r#"INSERT INTO sessions (session_id, user_id, project_id, status, created_at, last_active_at, metadata)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    session.session_id,
                    session.user_id,
                    session.project_id,
                    session_status_as_str(&session.status),
                    session.created_at.to_rfc3339(),
                    session.last_active_at.to_rfc3339(),
                    serde_json::to_string(&session.metadata).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.query_row(
                r#"SELECT session_id, user_id, project_id, status, created_at, last_active_at, metadata
                   FROM sessions WHERE session_id = ?1"#,
                [&session_id],
                row_to_session,
            )
            .optional()
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> EngineResult<()> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE sessions SET status = ?1, last_active_at = ?2 WHERE session_id = ?3",
                params![session_status_as_str(&status), Utc::now().to_rfc3339(), session_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    // ---- conversations ----

    pub async fn create_conversation(&self, conv: Conversation) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                r#"INSERT INTO conversations (session_id, title, started_at, ended_at, message_count, summary)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                params![
                    conv.session_id,
                    conv.title,
                    conv.started_at.to_rfc3339(),
                    conv.ended_at.map(|t| t.to_rfc3339()),
                    conv.message_count,
                    conv.summary,
                ],
            )
            .map_err(EngineError::from)?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn end_conversation(&self, conversation_id: i64, summary: Option<String>) -> EngineResult<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                "UPDATE conversations SET ended_at = ?1, summary = COALESCE(?2, summary) WHERE id = ?3",
                params![Utc::now().to_rfc3339(), summary, conversation_id],
            )
            .map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    // ---- messages ----

    pub async fn insert_message(&self, mut message: Message) -> EngineResult<i64> {
        let db = self.conn();
        task::spawn_blocking(move || {
            if message.content.is_empty() {
                return Err(EngineError::ConstraintViolation("message content must not be empty".into()));
            }
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.execute(
                r#"INSERT INTO messages (
                    conversation_id, role, content, token_count, created_at, importance_score,
                    is_summarized, original_content, tier, agent_id, reference_count, promotion_count,
                    tier_promoted_at, last_referenced_at, source_agent_id, shared_with_agents, handoff_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
                params![
                    message.conversation_id,
                    message_role_as_str(&message.role),
                    message.content,
                    message.token_count,
                    message.created_at.to_rfc3339(),
                    message.importance_score,
                    message.is_summarized,
                    message.original_content,
                    tier_as_str(&message.tier),
                    message.agent_id,
                    message.reference_count,
                    message.promotion_count,
                    message.tier_promoted_at.map(|t| t.to_rfc3339()),
                    message.last_referenced_at.to_rfc3339(),
                    message.source_agent_id,
                    serde_json::to_string(&message.shared_with_agents).unwrap_or_else(|_| "[]".into()),
                    message.handoff_id,
                ],
            )
            .map_err(EngineError::from)?;
            message.id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE conversations SET message_count = message_count + 1 WHERE id = ?1",
                [message.conversation_id],
            )
            .map_err(EngineError::from)?;
            Ok(message.id)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn get_message(&self, message_id: i64) -> EngineResult<Message> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            conn.query_row(
                &format!("{MESSAGE_SELECT} WHERE id = ?1"),
                [message_id],
                row_to_message,
            )
            .optional()
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn recent_messages(&self, session_id: &str, limit: i64) -> EngineResult<Vec<Message>> {
        let db = self.conn();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "{MESSAGE_SELECT} WHERE conversation_id IN (SELECT id FROM conversations WHERE session_id = ?1) \
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![session_id, limit], row_to_message)
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn mark_messages_summarized(&self, ids: &[i64], truncate_to: usize) -> EngineResult<()> {
        let db = self.conn();
        let ids = ids.to_vec();
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let tx = conn.transaction().map_err(EngineError::from)?;
            for id in ids {
                let content: String = tx
                    .query_row("SELECT content FROM messages WHERE id = ?1", [id], |r| r.get(0))
                    .map_err(EngineError::from)?;
                if content.chars().count() <= truncate_to {
                    tx.execute(
                        "UPDATE messages SET is_summarized = 1 WHERE id = ?1",
                        [id],
                    )
                    .map_err(EngineError::from)?;
                    continue;
                }
                let truncated: String = content.chars().take(truncate_to).collect();
                let truncated = format!("{truncated}...");
                tx.execute(
                    "UPDATE messages SET is_summarized = 1, original_content = content, content = ?2, \
                     token_count = ?3 WHERE id = ?1",
                    params![id, truncated.clone(), (truncated.len() / 4) as i64],
                )
                .map_err(EngineError::from)?;
            }
            tx.commit().map_err(EngineError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }

    pub async fn search_messages(&self, query: &str, k: i64) -> EngineResult<Vec<(Message, f64)>> {
        let db = self.conn();
        let query = query.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngineError::IoFailed("poisoned sqlite connection mutex".into()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT m.*, bm25(messages_fts) AS rank FROM messages m \
                     JOIN messages_fts ON messages_fts.rowid = m.id \
                     WHERE messages_fts MATCH ?1 ORDER BY rank LIMIT ?2",
                ))
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map(params![query, k], |row| {
                    let msg = row_to_message(row)?;
                    let raw_rank: f64 = row.get("rank")?;
                    let normalized = 1.0 / (1.0 + (-raw_rank).max(0.0));
                    Ok((msg, normalized))
                })
                .map_err(EngineError::from)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
        .map_err(|e| EngineError::IoFailed(e.to_string()))?
    }
}

const MESSAGE_SELECT: &str = r#"SELECT id, conversation_id, role, content, token_count, created_at,
    importance_score, is_summarized, original_content, tier, agent_id, reference_count, promotion_count,
    tier_promoted_at, last_referenced_at, source_agent_id, shared_with_agents, handoff_id FROM messages"#;

pub(crate) fn row_to_message_pub(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    row_to_message(row)
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let tier: String = row.get("tier")?;
    let shared_raw: String = row.get("shared_with_agents")?;
    let tier_promoted_at: Option<String> = row.get("tier_promoted_at")?;
    let created_at: String = row.get("created_at")?;
    let last_referenced_at: String = row.get("last_referenced_at")?;
    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        role: parse_message_role(&role),
        content: row.get("content")?,
        token_count: row.get("token_count")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        importance_score: row.get("importance_score")?,
        is_summarized: row.get("is_summarized")?,
        original_content: row.get("original_content")?,
        tier: parse_tier(&tier),
        agent_id: row.get("agent_id")?,
        reference_count: row.get("reference_count")?,
        promotion_count: row.get("promotion_count")?,
        tier_promoted_at: tier_promoted_at.and_then(|t| t.parse().ok()),
        last_referenced_at: last_referenced_at.parse().unwrap_or_else(|_| Utc::now()),
        source_agent_id: row.get("source_agent_id")?,
        shared_with_agents: serde_json::from_str(&shared_raw).unwrap_or_default(),
        handoff_id: row.get("handoff_id")?,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let last_active_at: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        status: parse_session_status(&status),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        last_active_at: last_active_at.parse().unwrap_or_else(|_| Utc::now()),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

pub fn session_status_as_str(s: &SessionStatus) -> &'static str {
    match s {
        SessionStatus::Active => "active",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
        SessionStatus::Archived => "archived",
    }
}

pub fn parse_session_status(s: &str) -> SessionStatus {
    match s {
        "paused" => SessionStatus::Paused,
        "completed" => SessionStatus::Completed,
        "archived" => SessionStatus::Archived,
        _ => SessionStatus::Active,
    }
}

pub fn message_role_as_str(r: &MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

pub fn parse_message_role(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        "tool" => MessageRole::Tool,
        _ => MessageRole::User,
    }
}

pub fn tier_as_str(t: &MemoryTier) -> &'static str {
    match t {
        MemoryTier::Conversation => "conversation",
        MemoryTier::Agent => "agent",
        MemoryTier::Project => "project",
    }
}

pub fn parse_tier(s: &str) -> MemoryTier {
    match s {
        "agent" => MemoryTier::Agent,
        "project" => MemoryTier::Project,
        _ => MemoryTier::Conversation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn new_session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            session_id: id.to_string(),
            user_id: "user-1".into(),
            project_id: None,
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            metadata: HashMap::new(),
        }
    }

    fn new_message(conversation_id: i64, content: &str) -> Message {
        let now = Utc::now();
        Message {
            id: 0,
            conversation_id,
            role: MessageRole::User,
            content: content.to_string(),
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
            shared_with_agents: HashSet::new(),
            handoff_id: None,
        }
    }

    #[tokio::test]
    async fn open_in_memory_runs_migrations_idempotently() {
        let store = Store::open_in_memory().unwrap();
        // re-running migrations against the same connection is a no-op
        {
            let mut conn = store.conn().lock().unwrap();
            run_migrations(&mut conn).unwrap();
        }
    }

    #[tokio::test]
    async fn session_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(new_session("s1")).await.unwrap();
        let fetched = store.get_session("s1").await.unwrap();
        assert_eq!(fetched.session_id, "s1");
        assert_eq!(fetched.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn message_insert_rejects_empty_content() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(new_session("s1")).await.unwrap();
        let conv_id = store
            .create_conversation(Conversation {
                id: 0,
                session_id: "s1".into(),
                title: None,
                started_at: Utc::now(),
                ended_at: None,
                message_count: 0,
                summary: None,
            })
            .await
            .unwrap();
        let err = store.insert_message(new_message(conv_id, "")).await.unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn fts_search_finds_inserted_message() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(new_session("s1")).await.unwrap();
        let conv_id = store
            .create_conversation(Conversation {
                id: 0,
                session_id: "s1".into(),
                title: None,
                started_at: Utc::now(),
                ended_at: None,
                message_count: 0,
                summary: None,
            })
            .await
            .unwrap();
        store
            .insert_message(new_message(conv_id, "the quick brown fox jumps"))
            .await
            .unwrap();
        let results = store.search_messages("fox", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].0.content.contains("fox"));
    }

    #[tokio::test]
    async fn invalid_sort_column_is_rejected() {
        assert!(validate_sort_column("timestamp; DROP TABLE messages--").is_err());
        assert!(validate_sort_column("created_at").is_ok());
    }
}
