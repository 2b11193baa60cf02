//! Events that can occur in a conversation

use super::state::ApprovalDecision;
use crate::history::{AiResponse, Message, ToolResult};
use crate::llm::LlmErrorKind;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // Caller events
    UserMessage {
        messages: Vec<Message>,
    },
    ApprovalDecision {
        decision: ApprovalDecision,
    },
    /// Abandon a pending approval (explicit cancel or expiry)
    Cancel {
        reason: String,
    },

    // Model events
    LlmResponse {
        response: AiResponse,
    },
    LlmError {
        message: String,
        error_kind: LlmErrorKind,
        attempt: u32,
    },
    RetryTimeout {
        attempt: u32,
    },

    // Tool events
    /// Results for the whole in-flight batch, in request order
    ToolsCompleted {
        results: Vec<ToolResult>,
    },

    /// The stored history broke the pairing rule
    HistoryInvalid {
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::UserMessage { .. } => "user_message",
            Event::ApprovalDecision { .. } => "approval_decision",
            Event::Cancel { .. } => "cancel",
            Event::LlmResponse { .. } => "llm_response",
            Event::LlmError { .. } => "llm_error",
            Event::RetryTimeout { .. } => "retry_timeout",
            Event::ToolsCompleted { .. } => "tools_completed",
            Event::HistoryInvalid { .. } => "history_invalid",
        }
    }
}
