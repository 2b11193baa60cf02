//! Effects produced by state transitions

use crate::history::{AiResponse, Message, ToolCall, ToolResult};
use std::time::Duration;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append a message to the history
    PersistMessage { message: Message },

    /// Append a batch of tool results, in order
    PersistToolResults { results: Vec<ToolResult> },

    /// Persist the new state
    PersistState,

    /// Make a model request with the current history
    RequestLlm,

    /// Run ungated calls concurrently
    DispatchTools { calls: Vec<ToolCall> },

    /// Record denials without running the tools
    DenyTools {
        calls: Vec<ToolCall>,
        reason: Option<String>,
    },

    /// Write the suspension checkpoint
    SaveCheckpoint {
        pending: ToolCall,
        remaining: Vec<ToolCall>,
    },

    /// Schedule a retry
    ScheduleRetry { delay: Duration, attempt: u32 },

    /// Tell the session's event stream what happened
    Notify(Notification),
}

/// Session-visible changes, consumed by the event translator
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The model answered; its text and requested calls are new in this session
    ModelResponded { response: AiResponse },
    ToolResolved { result: ToolResult },
    Suspended { pending: ToolCall },
    TurnFinished,
    Failed { message: String },
}

impl Effect {
    pub fn persist_messages(messages: Vec<Message>) -> impl Iterator<Item = Effect> {
        messages
            .into_iter()
            .map(|message| Effect::PersistMessage { message })
    }

    pub fn persist_ai_message(response: AiResponse) -> Self {
        Effect::PersistMessage {
            message: Message::Ai(response),
        }
    }

    pub fn notify_resolved(results: &[ToolResult]) -> impl Iterator<Item = Effect> + '_ {
        results.iter().map(|result| {
            Effect::Notify(Notification::ToolResolved {
                result: result.clone(),
            })
        })
    }

    pub fn notify_turn_finished() -> Self {
        Effect::Notify(Notification::TurnFinished)
    }

    pub fn notify_failed(message: impl Into<String>) -> Self {
        Effect::Notify(Notification::Failed {
            message: message.into(),
        })
    }
}
