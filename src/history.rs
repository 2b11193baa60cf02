//! Conversation message history
//!
//! The history is an ordered, append-only log. Every tool call made by the
//! model must be answered by exactly one tool result before the history is
//! handed back to the model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// ============================================================================
// Message Types
// ============================================================================

/// A single tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// How a tool call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Error,
    Denied,
}

/// The answer to a single [`ToolCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::with_outcome(call, content, ToolOutcome::Success)
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::with_outcome(call, content, ToolOutcome::Error)
    }

    pub fn denied(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::with_outcome(call, content, ToolOutcome::Denied)
    }

    fn with_outcome(call: &ToolCall, content: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: content.into(),
            outcome,
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome == ToolOutcome::Error
    }

    pub fn is_denied(&self) -> bool {
        self.outcome == ToolOutcome::Denied
    }
}

/// One model response: optional text plus the tool calls it requested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl AiResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System { text: String },
    Human { text: String },
    Ai(AiResponse),
    ToolResult(ToolResult),
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { text: text.into() }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Message::Human { text: text.into() }
    }

    /// Short name used for the `message_type` column and logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::Human { .. } => "human",
            Message::Ai(_) => "ai",
            Message::ToolResult(_) => "tool_result",
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Position of a message within a thread's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistoryRef(pub u64);

/// Ways a history can break the call/result pairing rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingViolation {
    #[error("tool result {tool_call_id} at position {position} has no preceding tool call")]
    OrphanResult { tool_call_id: String, position: usize },
    #[error("tool call {tool_call_id} was answered more than once")]
    DuplicateResult { tool_call_id: String },
    #[error("tool call id {tool_call_id} was issued more than once")]
    DuplicateCall { tool_call_id: String },
    #[error("tool call {tool_call_id} has no result")]
    UnresolvedCall { tool_call_id: String },
}

/// Ordered, append-only message log for one thread
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHistory {
    messages: Vec<Message>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from persisted messages in sequence order
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) -> HistoryRef {
        self.messages.push(message);
        HistoryRef(self.messages.len() as u64 - 1)
    }

    /// Immutable ordered copy of the log
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Every tool call in order of appearance
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.messages.iter().flat_map(|m| match m {
            Message::Ai(ai) => ai.tool_calls.as_slice(),
            _ => &[],
        })
    }

    /// Every tool result in order of appearance
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.messages.iter().filter_map(|m| match m {
            Message::ToolResult(r) => Some(r),
            _ => None,
        })
    }

    /// Ids of tool calls that already have a result
    pub fn resolved_call_ids(&self) -> HashSet<String> {
        self.tool_results().map(|r| r.tool_call_id.clone()).collect()
    }

    /// Calls still waiting for a result, in request order
    pub fn unresolved_calls(&self) -> Vec<ToolCall> {
        let resolved = self.resolved_call_ids();
        self.tool_calls()
            .filter(|c| !resolved.contains(&c.id))
            .cloned()
            .collect()
    }

    /// Look up a call by id
    pub fn find_call(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.tool_calls().find(|c| c.id == tool_call_id)
    }

    /// Check structure without requiring every call to be answered.
    ///
    /// Results must follow their call, and neither ids nor answers may repeat.
    /// Holds for histories of suspended threads too.
    pub fn check_structure(&self) -> Result<(), PairingViolation> {
        let mut issued: HashMap<&str, bool> = HashMap::new();

        for (position, message) in self.messages.iter().enumerate() {
            match message {
                Message::Ai(ai) => {
                    for call in &ai.tool_calls {
                        if issued.insert(call.id.as_str(), false).is_some() {
                            return Err(PairingViolation::DuplicateCall {
                                tool_call_id: call.id.clone(),
                            });
                        }
                    }
                }
                Message::ToolResult(result) => match issued.get_mut(result.tool_call_id.as_str()) {
                    None => {
                        return Err(PairingViolation::OrphanResult {
                            tool_call_id: result.tool_call_id.clone(),
                            position,
                        })
                    }
                    Some(answered) if *answered => {
                        return Err(PairingViolation::DuplicateResult {
                            tool_call_id: result.tool_call_id.clone(),
                        })
                    }
                    Some(answered) => *answered = true,
                },
                Message::System { .. } | Message::Human { .. } => {}
            }
        }
        Ok(())
    }

    /// Full pairing check required before the history goes to the model
    pub fn ensure_ready_for_model(&self) -> Result<(), PairingViolation> {
        self.check_structure()?;
        match self.unresolved_calls().into_iter().next() {
            Some(call) => Err(PairingViolation::UnresolvedCall {
                tool_call_id: call.id,
            }),
            None => Ok(()),
        }
    }
}
