use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::SchedulerResult;
use crate::store::{CleanupRunRecord, SqliteStore};

/// Three consecutive failed sweeps open the circuit; each subsequent failure
/// doubles the cooldown, capped at this ceiling.
const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 3;
const CIRCUIT_BREAKER_BASE_COOLDOWN_MS: u64 = 1_000;
const CIRCUIT_BREAKER_MAX_COOLDOWN_MS: u64 = 300_000;

/// Exponential cooldown once the breaker trips: doubles per failure beyond the
/// threshold, capped at `CIRCUIT_BREAKER_MAX_COOLDOWN_MS`.
fn circuit_breaker_cooldown_ms(consecutive_failures: u32) -> u64 {
    let doublings = consecutive_failures - CIRCUIT_BREAKER_FAILURE_THRESHOLD;
    CIRCUIT_BREAKER_BASE_COOLDOWN_MS
        .saturating_mul(1u64 << doublings.min(20))
        .min(CIRCUIT_BREAKER_MAX_COOLDOWN_MS)
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub tick_interval: Duration,
    pub session_ttl: chrono::Duration,
    pub message_ttl: chrono::Duration,
    pub vector_ttl: chrono::Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3600),
            session_ttl: chrono::Duration::days(30),
            message_ttl: chrono::Duration::days(90),
            vector_ttl: chrono::Duration::days(180),
        }
    }
}

/// Drives the periodic cleanup sweep: expired sessions, truncated message
/// bodies, stale vectors, then a vacuum pass.
pub struct CleanupService {
    store: SqliteStore,
    config: CleanupConfig,
}

pub struct CleanupHandle {
    stop_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl CleanupHandle {
    /// Signals the service to stop and waits for the current sweep (if any) to finish.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.await;
    }
}

impl CleanupService {
    pub fn open(db_path: &Path, config: CleanupConfig) -> SchedulerResult<Self> {
        Ok(Self {
            store: SqliteStore::open(db_path)?,
            config,
        })
    }

    pub fn with_store(store: SqliteStore, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    /// Runs one sweep immediately and returns what it did.
    pub async fn run_once(&self) -> SchedulerResult<CleanupRunRecord> {
        let sessions_deleted = self.store.delete_expired_sessions(self.config.session_ttl).await?;
        let messages_truncated = self
            .store
            .truncate_old_summarized_messages(self.config.message_ttl)
            .await?;
        let vectors_deleted = self.store.delete_stale_vectors(self.config.vector_ttl).await?;

        let before = self.store.database_size_bytes().await?;
        self.store.vacuum().await?;
        let after = self.store.database_size_bytes().await?;
        let bytes_reclaimed = (before - after).max(0);

        let record = CleanupRunRecord {
            ran_at: Utc::now(),
            sessions_deleted,
            messages_truncated,
            vectors_deleted,
            bytes_reclaimed,
        };
        self.store.record_cleanup_run(&record).await?;

        info!(
            sessions_deleted,
            messages_truncated, vectors_deleted, bytes_reclaimed, "cleanup sweep finished"
        );
        Ok(record)
    }

    /// Spawns the interval-driven loop. Returns a handle that stops it on drop of its join,
    /// or explicitly via `shutdown()`. Three consecutive failed sweeps open a local circuit
    /// breaker that skips ticks for an exponentially growing cooldown before retrying.
    pub fn spawn(self) -> CleanupHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;
            let mut cooldown_until: Option<tokio::time::Instant> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(until) = cooldown_until {
                            if tokio::time::Instant::now() < until {
                                warn!("cleanup circuit open, skipping tick");
                                continue;
                            }
                            cooldown_until = None;
                        }
                        match self.run_once().await {
                            Ok(_) => consecutive_failures = 0,
                            Err(err) => {
                                consecutive_failures += 1;
                                warn!(%err, consecutive_failures, "cleanup sweep failed");
                                if consecutive_failures >= CIRCUIT_BREAKER_FAILURE_THRESHOLD {
                                    let cooldown_ms = circuit_breaker_cooldown_ms(consecutive_failures);
                                    warn!(cooldown_ms, "cleanup circuit breaker tripped");
                                    cooldown_until = Some(tokio::time::Instant::now() + Duration::from_millis(cooldown_ms));
                                }
                            }
                        }
                    }
                    _ = &mut stop_rx => {
                        info!("cleanup service stopping");
                        break;
                    }
                }
            }
        });
        CleanupHandle { stop_tx, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_schema(conn: &rusqlite::Connection) {
        conn.execute_batch(
            r#"
            CREATE TABLE sessions (session_id TEXT PRIMARY KEY, status TEXT, last_active_at TEXT);
            CREATE TABLE messages (id INTEGER PRIMARY KEY, is_summarized INTEGER, original_content TEXT, created_at TEXT);
            CREATE TABLE message_embeddings (message_id INTEGER PRIMARY KEY, created_at TEXT);
            CREATE TABLE message_vectors (message_id INTEGER PRIMARY KEY);
            CREATE TABLE cleanup_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ran_at TEXT NOT NULL,
                sessions_deleted INTEGER NOT NULL DEFAULT 0,
                messages_truncated INTEGER NOT NULL DEFAULT 0,
                vectors_deleted INTEGER NOT NULL DEFAULT 0,
                bytes_reclaimed INTEGER NOT NULL DEFAULT 0
            );
            INSERT INTO sessions VALUES ('old', 'archived', '2000-01-01T00:00:00Z');
            INSERT INTO sessions VALUES ('new', 'active', '2000-01-01T00:00:00Z');
            INSERT INTO messages VALUES (1, 1, 'stale body', '2000-01-01T00:00:00Z');
            INSERT INTO messages VALUES (2, 0, 'kept body', '2000-01-01T00:00:00Z');
            INSERT INTO message_embeddings VALUES (1, '2000-01-01T00:00:00Z');
            INSERT INTO message_vectors VALUES (1);
            "#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn run_once_sweeps_expired_state_and_logs_it() {
        // SqliteStore hides its connection, so seed the schema directly on an
        // on-disk file before handing the same path to CleanupService::open.
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tapestry.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            seed_schema(&conn);
        }

        let service = CleanupService::open(&db_path, CleanupConfig::default()).unwrap();
        let record = service.run_once().await.unwrap();
        assert_eq!(record.sessions_deleted, 1);
        assert_eq!(record.messages_truncated, 0); // message is fresh, not past the 90d ttl
        assert_eq!(record.vectors_deleted, 0);

        let runs = service.store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn circuit_breaker_cooldown_grows_and_caps() {
        let first = circuit_breaker_cooldown_ms(CIRCUIT_BREAKER_FAILURE_THRESHOLD);
        let second = circuit_breaker_cooldown_ms(CIRCUIT_BREAKER_FAILURE_THRESHOLD + 1);
        assert!(second > first);
        assert!(circuit_breaker_cooldown_ms(200) <= CIRCUIT_BREAKER_MAX_COOLDOWN_MS);
    }
}
