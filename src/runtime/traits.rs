//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::db::{Database, DbError};
use crate::history::{HistoryRef, Message, MessageHistory};
use crate::state_machine::{Checkpoint, ConvState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Storage for conversation messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append messages in order
    async fn append_messages(
        &self,
        thread_id: &str,
        messages: &[Message],
    ) -> Result<Vec<HistoryRef>, String>;

    /// Full history of a thread
    async fn get_history(&self, thread_id: &str) -> Result<MessageHistory, String>;
}

/// Storage for conversation state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the thread if needed and return its state
    async fn ensure_thread(&self, thread_id: &str) -> Result<ConvState, String>;

    async fn update_state(&self, thread_id: &str, state: &ConvState) -> Result<(), String>;

    /// `None` for an unknown thread
    async fn get_state(&self, thread_id: &str) -> Result<Option<ConvState>, String>;
}

/// Storage for suspension checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fails if the thread already has a live checkpoint
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), String>;

    async fn get_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String>;

    /// Read and delete atomically
    async fn take_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String>;

    async fn checkpoints_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Checkpoint>, String>;
}

/// Combined storage trait for convenience
pub trait Storage: MessageStore + StateStore + CheckpointStore {}
impl<T: MessageStore + StateStore + CheckpointStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn append_messages(
        &self,
        thread_id: &str,
        messages: &[Message],
    ) -> Result<Vec<HistoryRef>, String> {
        (**self).append_messages(thread_id, messages).await
    }

    async fn get_history(&self, thread_id: &str) -> Result<MessageHistory, String> {
        (**self).get_history(thread_id).await
    }
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn ensure_thread(&self, thread_id: &str) -> Result<ConvState, String> {
        (**self).ensure_thread(thread_id).await
    }

    async fn update_state(&self, thread_id: &str, state: &ConvState) -> Result<(), String> {
        (**self).update_state(thread_id, state).await
    }

    async fn get_state(&self, thread_id: &str) -> Result<Option<ConvState>, String> {
        (**self).get_state(thread_id).await
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), String> {
        (**self).save_checkpoint(checkpoint).await
    }

    async fn get_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String> {
        (**self).get_checkpoint(thread_id).await
    }

    async fn take_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String> {
        (**self).take_checkpoint(thread_id).await
    }

    async fn checkpoints_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Checkpoint>, String> {
        (**self).checkpoints_older_than(cutoff).await
    }
}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn append_messages(
        &self,
        thread_id: &str,
        messages: &[Message],
    ) -> Result<Vec<HistoryRef>, String> {
        self.db
            .append_messages(thread_id, messages)
            .map_err(|e| e.to_string())
    }

    async fn get_history(&self, thread_id: &str) -> Result<MessageHistory, String> {
        self.db.get_history(thread_id).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl StateStore for DatabaseStorage {
    async fn ensure_thread(&self, thread_id: &str) -> Result<ConvState, String> {
        let thread = self.db.ensure_thread(thread_id).map_err(|e| e.to_string())?;
        Ok(thread.state)
    }

    async fn update_state(&self, thread_id: &str, state: &ConvState) -> Result<(), String> {
        self.db
            .update_thread_state(thread_id, state)
            .map_err(|e| e.to_string())
    }

    async fn get_state(&self, thread_id: &str) -> Result<Option<ConvState>, String> {
        match self.db.get_thread(thread_id) {
            Ok(thread) => Ok(Some(thread.state)),
            Err(DbError::ThreadNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), String> {
        self.db.save_checkpoint(checkpoint).map_err(|e| e.to_string())
    }

    async fn get_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String> {
        self.db.get_checkpoint(thread_id).map_err(|e| e.to_string())
    }

    async fn take_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, String> {
        self.db.take_checkpoint(thread_id).map_err(|e| e.to_string())
    }

    async fn checkpoints_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Checkpoint>, String> {
        self.db
            .checkpoints_older_than(cutoff)
            .map_err(|e| e.to_string())
    }
}
