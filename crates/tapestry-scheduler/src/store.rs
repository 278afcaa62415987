use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
pub struct CleanupRunRecord {
    pub ran_at: DateTime<Utc>,
    pub sessions_deleted: i64,
    pub messages_truncated: i64,
    pub vectors_deleted: i64,
    pub bytes_reclaimed: i64,
}

/// Persistence for the cleanup service. Opens the same SQLite file the memory
/// engine manages, adds its own schema-version table, and records its own
/// run history alongside the engine's `cleanup_log`.
///
/// The memory engine must open the file (and run its migrations) at least
/// once before the scheduler does, since cleanup sweeps operate on tables
/// (`sessions`, `messages`, `message_vectors`, `cleanup_log`, ...) that belong
/// to that schema.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> SchedulerResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| SchedulerError::StoreOpenError(format!("opening {}: {e}", db_path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> SchedulerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SchedulerError::StoreOpenError(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Deletes archived sessions older than `ttl`. Cascades to conversations and messages.
    pub async fn delete_expired_sessions(&self, ttl: chrono::Duration) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - ttl).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE status = 'archived' AND last_active_at < ?1",
            [cutoff],
        )?;
        Ok(deleted as i64)
    }

    /// Nulls `original_content` of already-summarized messages older than `ttl`.
    pub async fn truncate_old_summarized_messages(&self, ttl: chrono::Duration) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - ttl).to_rfc3339();
        let updated = conn.execute(
            "UPDATE messages SET original_content = NULL \
             WHERE is_summarized = 1 AND original_content IS NOT NULL AND created_at < ?1",
            [cutoff],
        )?;
        Ok(updated as i64)
    }

    /// Deletes orphan vectors (message no longer exists) plus vectors older than `ttl`.
    pub async fn delete_stale_vectors(&self, ttl: chrono::Duration) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - ttl).to_rfc3339();

        let orphan_ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT message_id FROM message_embeddings \
                 WHERE message_id NOT IN (SELECT id FROM messages)",
            )?;
            stmt.query_map([], |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let stale_ids: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT message_id FROM message_embeddings WHERE created_at < ?1")?;
            stmt.query_map([&cutoff], |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut to_delete: HashSet<i64> = orphan_ids.into_iter().collect();
        to_delete.extend(stale_ids);

        for id in &to_delete {
            conn.execute("DELETE FROM message_embeddings WHERE message_id = ?1", [id])?;
            conn.execute("DELETE FROM message_vectors WHERE message_id = ?1", [id])?;
        }
        Ok(to_delete.len() as i64)
    }

    pub async fn vacuum(&self) -> SchedulerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    pub async fn database_size_bytes(&self) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    pub async fn record_cleanup_run(&self, record: &CleanupRunRecord) -> SchedulerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO cleanup_log (ran_at, sessions_deleted, messages_truncated, vectors_deleted, bytes_reclaimed)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                record.ran_at.to_rfc3339(),
                record.sessions_deleted,
                record.messages_truncated,
                record.vectors_deleted,
                record.bytes_reclaimed,
            ],
        )?;
        conn.execute(
            r#"INSERT INTO scheduler_run_history (ran_at, sessions_deleted, messages_truncated, vectors_deleted, bytes_reclaimed)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                record.ran_at.to_rfc3339(),
                record.sessions_deleted,
                record.messages_truncated,
                record.vectors_deleted,
                record.bytes_reclaimed,
            ],
        )?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> SchedulerResult<Vec<CleanupRunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ran_at, sessions_deleted, messages_truncated, vectors_deleted, bytes_reclaimed \
             FROM scheduler_run_history ORDER BY ran_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |r| {
            let ran_at: String = r.get(0)?;
            Ok(CleanupRunRecord {
                ran_at: ran_at.parse().unwrap_or_else(|_| Utc::now()),
                sessions_deleted: r.get(1)?,
                messages_truncated: r.get(2)?,
                vectors_deleted: r.get(3)?,
                bytes_reclaimed: r.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(SchedulerError::from)
    }
}

fn run_migrations(conn: &Connection) -> SchedulerResult<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __scheduler_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __scheduler_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_run_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ran_at TEXT NOT NULL,
            sessions_deleted INTEGER NOT NULL DEFAULT 0,
            messages_truncated INTEGER NOT NULL DEFAULT 0,
            vectors_deleted INTEGER NOT NULL DEFAULT 0,
            bytes_reclaimed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_scheduler_run_history_ran_at ON scheduler_run_history(ran_at DESC);
        "#,
    )];

    for (version, sql) in migrations {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO __scheduler_schema_version(version) VALUES (?1)", [version])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_expired_sessions_ignores_active_sessions() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute_batch(
                r#"CREATE TABLE sessions (session_id TEXT PRIMARY KEY, status TEXT, last_active_at TEXT);
                   INSERT INTO sessions VALUES ('s1', 'active', '2000-01-01T00:00:00Z');
                   INSERT INTO sessions VALUES ('s2', 'archived', '2000-01-01T00:00:00Z');"#,
            )
            .unwrap();
        }
        let deleted = store.delete_expired_sessions(chrono::Duration::days(1)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
