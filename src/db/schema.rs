//! Database schema and row types

use crate::state_machine::ConvState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL DEFAULT '{"type":"idle"}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (thread_id, sequence_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, sequence_id);

-- At most one live checkpoint per thread
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT PRIMARY KEY,
    history_len INTEGER NOT NULL,
    pending TEXT NOT NULL,
    remaining TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);
"#;

/// Thread row
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: String,
    pub state: ConvState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

/// What startup recovery changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Threads reset to idle
    pub threads_reset: usize,
    /// Synthetic results injected for calls that never completed
    pub results_injected: usize,
    /// Threads left suspended with a live checkpoint
    pub suspended_kept: usize,
}
