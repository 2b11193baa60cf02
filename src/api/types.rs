//! API request and response types

use crate::history::{Message, ToolCall};
use crate::runtime::AgentRequest;
use crate::state_machine::{ApprovalDecision, ExecutionStatus};
use crate::translator::{decode_ui_messages, UiMessage};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/agent`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequestBody {
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Client-side UI history; only its final user message is new
    #[serde(default)]
    pub messages: Vec<UiMessage>,
    #[serde(default)]
    pub approval_decision: Option<ApprovalDecision>,
}

impl AgentRequestBody {
    pub fn into_request(self) -> AgentRequest {
        // Earlier user messages are already stored, even after a failed turn
        let new_messages = decode_ui_messages(&self.messages)
            .pop()
            .filter(|m| matches!(m, Message::Human { .. }))
            .into_iter()
            .collect();

        AgentRequest {
            thread_id: self.thread_id,
            new_messages,
            approval_decision: self.approval_decision,
        }
    }
}

/// Response for `GET /api/threads/:id`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResponse {
    pub thread_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool_call: Option<ToolCall>,
    pub messages: Vec<UiMessage>,
}

/// Response for cancel action
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub status: ExecutionStatus,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
