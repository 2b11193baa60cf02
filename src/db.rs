//! Database module
//!
//! Persists threads, their message histories and suspension checkpoints.

mod schema;

pub use schema::*;

use crate::history::{HistoryRef, Message, MessageHistory, ToolResult};
use crate::state_machine::{Checkpoint, ConvState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Thread {0} already has a live checkpoint")]
    CheckpointExists(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Result content injected for calls cut off by a restart
pub const INTERRUPTED_RESULT: &str = "Tool call was interrupted by a server restart";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A panic while holding the lock cannot leave a half-applied write:
    /// multi-statement writes run in transactions.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Thread Operations ====================

    /// Create the thread if it does not exist yet
    pub fn ensure_thread(&self, id: &str) -> DbResult<Thread> {
        {
            let conn = self.conn();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO threads (id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id, serde_json::to_string(&ConvState::Idle)?, now],
            )?;
        }
        self.get_thread(id)
    }

    pub fn get_thread(&self, id: &str) -> DbResult<Thread> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT t.id, t.state, t.created_at, t.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id)
                 FROM threads t WHERE t.id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| DbError::ThreadNotFound(id.to_string()))?;

        let (id, state, created_at, updated_at, message_count) = row;
        Ok(Thread {
            id,
            state: serde_json::from_str(&state)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
            message_count,
        })
    }

    pub fn update_thread_state(&self, id: &str, state: &ConvState) -> DbResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE threads SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(state)?, Utc::now().to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ThreadNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append messages in order, atomically
    pub fn append_messages(&self, thread_id: &str, messages: &[Message]) -> DbResult<Vec<HistoryRef>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let refs = messages
            .iter()
            .map(|m| insert_message(&tx, thread_id, m, &now))
            .collect::<DbResult<Vec<_>>>()?;
        tx.commit()?;
        Ok(refs)
    }

    pub fn append_message(&self, thread_id: &str, message: &Message) -> DbResult<HistoryRef> {
        let conn = self.conn();
        insert_message(&conn, thread_id, message, &Utc::now())
    }

    pub fn get_history(&self, thread_id: &str) -> DbResult<MessageHistory> {
        let conn = self.conn();
        load_history(&conn, thread_id)
    }

    // ==================== Checkpoint Operations ====================

    /// Store a checkpoint; fails if the thread already has one
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> DbResult<()> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO checkpoints (thread_id, history_len, pending, remaining, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.thread_id,
                i64::try_from(checkpoint.history_len).unwrap_or(i64::MAX),
                serde_json::to_string(&checkpoint.pending)?,
                serde_json::to_string(&checkpoint.remaining)?,
                checkpoint.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DbError::CheckpointExists(checkpoint.thread_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read without consuming
    pub fn get_checkpoint(&self, thread_id: &str) -> DbResult<Option<Checkpoint>> {
        let conn = self.conn();
        load_checkpoint(&conn, thread_id)
    }

    /// Read and delete in one transaction; only one caller can win
    pub fn take_checkpoint(&self, thread_id: &str) -> DbResult<Option<Checkpoint>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let checkpoint = load_checkpoint(&tx, thread_id)?;
        if checkpoint.is_some() {
            tx.execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![thread_id])?;
        }
        tx.commit()?;
        Ok(checkpoint)
    }

    /// Checkpoints created before `cutoff`
    pub fn checkpoints_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT thread_id FROM checkpoints WHERE created_at < ?1 ORDER BY created_at ASC",
        )?;
        let ids = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut checkpoints = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cp) = load_checkpoint(&conn, &id)? {
                checkpoints.push(cp);
            }
        }
        Ok(checkpoints)
    }

    // ==================== Recovery ====================

    /// Repair threads left mid-turn by a restart.
    ///
    /// A terminated thread stays terminated and loses any checkpoint. A
    /// thread with a live checkpoint stays suspended. Any other thread in a
    /// running state gets an error result for each unanswered call and is
    /// reset to idle.
    pub fn recover_interrupted(&self) -> DbResult<RecoveryReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        let threads = {
            let mut stmt = tx.prepare("SELECT id, state FROM threads")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (thread_id, state_json) in threads {
            // Unreadable state is treated as interrupted
            let state: Option<ConvState> = serde_json::from_str(&state_json).ok();

            // Termination is final; a leftover checkpoint must not revive the thread
            if matches!(state, Some(ConvState::Terminated { .. })) {
                tx.execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![thread_id])?;
                continue;
            }

            if let Some(checkpoint) = load_checkpoint(&tx, &thread_id)? {
                let suspended = checkpoint.state();
                if state.as_ref() != Some(&suspended) {
                    set_state(&tx, &thread_id, &suspended, &now)?;
                }
                report.suspended_kept += 1;
                continue;
            }

            if matches!(
                state,
                Some(ConvState::Idle | ConvState::Error { .. } | ConvState::Terminated { .. })
            ) {
                continue;
            }

            let history = load_history(&tx, &thread_id)?;
            for call in history.unresolved_calls() {
                let result = ToolResult::error(&call, INTERRUPTED_RESULT);
                insert_message(&tx, &thread_id, &Message::ToolResult(result), &now)?;
                report.results_injected += 1;
            }
            set_state(&tx, &thread_id, &ConvState::Idle, &now)?;
            report.threads_reset += 1;

            tracing::info!(
                thread_id = %thread_id,
                previous_state = state.as_ref().map_or("unreadable", ConvState::name),
                "Reset interrupted thread to idle"
            );
        }

        tx.commit()?;
        Ok(report)
    }
}

fn insert_message(
    conn: &Connection,
    thread_id: &str,
    message: &Message,
    now: &DateTime<Utc>,
) -> DbResult<HistoryRef> {
    let sequence_id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence_id), -1) + 1 FROM messages WHERE thread_id = ?1",
        params![thread_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO messages (message_id, thread_id, sequence_id, message_type, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            thread_id,
            sequence_id,
            message.kind(),
            serde_json::to_string(message)?,
            now.to_rfc3339(),
        ],
    )?;

    Ok(HistoryRef(u64::try_from(sequence_id).unwrap_or_default()))
}

fn load_history(conn: &Connection, thread_id: &str) -> DbResult<MessageHistory> {
    let mut stmt = conn.prepare(
        "SELECT content FROM messages WHERE thread_id = ?1 ORDER BY sequence_id ASC",
    )?;
    let rows = stmt
        .query_map(params![thread_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let messages = rows
        .iter()
        .map(|content| serde_json::from_str(content))
        .collect::<Result<Vec<Message>, _>>()?;
    Ok(MessageHistory::from_messages(messages))
}

fn load_checkpoint(conn: &Connection, thread_id: &str) -> DbResult<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT history_len, pending, remaining, created_at FROM checkpoints WHERE thread_id = ?1",
            params![thread_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((history_len, pending, remaining, created_at)) = row else {
        return Ok(None);
    };
    Ok(Some(Checkpoint {
        thread_id: thread_id.to_string(),
        history_len: usize::try_from(history_len).unwrap_or_default(),
        pending: serde_json::from_str(&pending)?,
        remaining: serde_json::from_str(&remaining)?,
        created_at: parse_datetime(&created_at),
    }))
}

fn set_state(conn: &Connection, thread_id: &str, state: &ConvState, now: &DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "UPDATE threads SET state = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(state)?, now.to_rfc3339(), thread_id],
    )?;
    Ok(())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
