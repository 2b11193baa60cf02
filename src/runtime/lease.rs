//! Per-thread session leases
//!
//! A thread runs at most one session at a time within this process. The
//! lease is held by the session task and released when it is dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
pub(crate) struct ThreadLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ThreadLeases {
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` if another session holds the thread
    pub(crate) fn try_acquire(&self, thread_id: &str) -> Option<ThreadLease> {
        if !self.held().insert(thread_id.to_string()) {
            return None;
        }
        Some(ThreadLease {
            leases: self.clone(),
            thread_id: thread_id.to_string(),
        })
    }

    pub(crate) fn is_held(&self, thread_id: &str) -> bool {
        self.held().contains(thread_id)
    }
}

#[derive(Debug)]
pub(crate) struct ThreadLease {
    leases: ThreadLeases,
    thread_id: String,
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        self.leases.held().remove(&self.thread_id);
    }
}
