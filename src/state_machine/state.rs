//! Conversation state types

use crate::history::ToolCall;
use crate::llm::LlmErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Conversation state
///
/// Only `AwaitingApproval` is expected to survive a process restart; every
/// other non-idle state is repaired at startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input
    #[default]
    Idle,

    /// Waiting for the model
    LlmRequesting { attempt: u32 },

    /// Running a contiguous run of ungated calls.
    /// `remaining` holds the rest of the model's batch, in request order.
    ToolDispatching {
        batch: Vec<ToolCall>,
        remaining: Vec<ToolCall>,
    },

    /// Suspended on a gated call until a human decides
    AwaitingApproval {
        pending: ToolCall,
        remaining: Vec<ToolCall>,
    },

    /// Abandoning a suspended batch; denials are being recorded
    Cancelling { batch: Vec<ToolCall> },

    /// Model failure; a new user message recovers
    Error {
        message: String,
        error_kind: LlmErrorKind,
    },

    /// The history is unusable; the thread accepts nothing further
    Terminated { reason: String },
}

impl ConvState {
    /// Externally visible status
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ConvState::Idle | ConvState::Error { .. } => ExecutionStatus::Idle,
            ConvState::LlmRequesting { .. }
            | ConvState::ToolDispatching { .. }
            | ConvState::Cancelling { .. } => ExecutionStatus::Running,
            ConvState::AwaitingApproval { pending, .. } => ExecutionStatus::AwaitingApproval {
                pending: pending.clone(),
            },
            ConvState::Terminated { .. } => ExecutionStatus::Terminated,
        }
    }

    /// True when no further internal event can arrive without outside input
    pub fn is_quiescent(&self) -> bool {
        !matches!(self.status(), ExecutionStatus::Running)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Idle => "idle",
            ConvState::LlmRequesting { .. } => "llm_requesting",
            ConvState::ToolDispatching { .. } => "tool_dispatching",
            ConvState::AwaitingApproval { .. } => "awaiting_approval",
            ConvState::Cancelling { .. } => "cancelling",
            ConvState::Error { .. } => "error",
            ConvState::Terminated { .. } => "terminated",
        }
    }
}

/// Status of a thread as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    AwaitingApproval { pending: ToolCall },
    Terminated,
}

/// A human's answer to a gated call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub tool_call_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            approved: true,
            reason: None,
        }
    }

    pub fn deny(tool_call_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            approved: false,
            reason,
        }
    }
}

/// Durable record of a suspended turn
///
/// `history_len` pins the history prefix at suspension. Histories only grow,
/// so the prefix is the snapshot; resuming against a history of any other
/// length is an invariant violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub history_len: usize,
    pub pending: ToolCall,
    /// Calls from the same batch after `pending`
    pub remaining: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The state this checkpoint resumes into
    pub fn state(&self) -> ConvState {
        ConvState::AwaitingApproval {
            pending: self.pending.clone(),
            remaining: self.remaining.clone(),
        }
    }
}

/// Context for a conversation (immutable configuration)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub thread_id: String,
    /// Tools whose every call needs approval
    pub gated_tools: HashSet<String>,
    pub max_llm_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
}

pub const DEFAULT_MAX_LLM_ATTEMPTS: u32 = 3;

impl ConvContext {
    pub fn new(thread_id: impl Into<String>, gated_tools: HashSet<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            gated_tools,
            max_llm_attempts: DEFAULT_MAX_LLM_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_policy(mut self, max_llm_attempts: u32, retry_base_delay: Duration) -> Self {
        self.max_llm_attempts = max_llm_attempts.max(1);
        self.retry_base_delay = retry_base_delay;
        self
    }

    pub fn is_gated(&self, tool_name: &str) -> bool {
        self.gated_tools.contains(tool_name)
    }
}
