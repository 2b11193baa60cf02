//! UI message codec
//!
//! Converts between the stored history and the UI message list a chat client
//! renders and posts back. Decoding never produces a model response whose
//! calls lack results.

use crate::history::{AiResponse, Message, MessageHistory, ToolCall, ToolOutcome, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Tool part state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

impl ToolState {
    fn is_resolved(self) -> bool {
        matches!(
            self,
            ToolState::OutputAvailable | ToolState::OutputError | ToolState::OutputDenied
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiMessagePart {
    Text {
        text: String,
    },

    #[serde(rename = "tool-invocation")]
    Tool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(rename = "errorText", default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },

    /// Part kinds this server ignores (reasoning, files, step markers)
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: UiRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub parts: Vec<UiMessagePart>,
}

impl UiMessage {
    pub fn new(id: impl Into<String>, role: UiRole) -> Self {
        Self {
            id: id.into(),
            role,
            metadata: None,
            parts: Vec::new(),
        }
    }

    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, UiRole::User).with_part(UiMessagePart::Text { text: text.into() })
    }

    #[must_use]
    pub fn with_part(mut self, part: UiMessagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// All text parts joined
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                UiMessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Render a history for a client.
///
/// Tool results are folded into the assistant message that requested them.
/// Only a call with no result yet (the one awaiting approval) is rendered as
/// `input-available`.
pub fn encode_history(history: &MessageHistory) -> Vec<UiMessage> {
    let results: HashMap<&str, &ToolResult> = history
        .tool_results()
        .map(|r| (r.tool_call_id.as_str(), r))
        .collect();

    history
        .messages()
        .iter()
        .enumerate()
        .filter_map(|(index, message)| {
            let id = format!("msg-{index}");
            match message {
                Message::System { text } => Some(
                    UiMessage::new(id, UiRole::System).with_part(UiMessagePart::Text { text: text.clone() }),
                ),
                Message::Human { text } => Some(UiMessage::user(id, text.clone())),
                Message::Ai(response) => {
                    let mut ui = UiMessage::new(id, UiRole::Assistant);
                    if !response.text.is_empty() {
                        ui = ui.with_part(UiMessagePart::Text {
                            text: response.text.clone(),
                        });
                    }
                    for call in &response.tool_calls {
                        ui = ui.with_part(tool_part(call, results.get(call.id.as_str()).copied()));
                    }
                    Some(ui)
                }
                Message::ToolResult(_) => None,
            }
        })
        .collect()
}

fn tool_part(call: &ToolCall, result: Option<&ToolResult>) -> UiMessagePart {
    let (state, output, error_text) = match result {
        None => (ToolState::InputAvailable, None, None),
        Some(r) => match r.outcome {
            ToolOutcome::Success => (ToolState::OutputAvailable, Some(Value::String(r.content.clone())), None),
            ToolOutcome::Error => (ToolState::OutputError, None, Some(r.content.clone())),
            ToolOutcome::Denied => (ToolState::OutputDenied, None, Some(r.content.clone())),
        },
    };

    UiMessagePart::Tool {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        state,
        input: Some(call.args.clone()),
        output,
        error_text,
    }
}

/// Turn client UI messages back into history messages.
///
/// Tool parts that never reached an output state are dropped, so every
/// decoded call is immediately followed by its result.
pub fn decode_ui_messages(messages: &[UiMessage]) -> Vec<Message> {
    let mut decoded = Vec::new();

    for ui in messages {
        match ui.role {
            UiRole::System => {
                let text = ui.text_content();
                if !text.is_empty() {
                    decoded.push(Message::system(text));
                }
            }
            UiRole::User => {
                let text = ui.text_content();
                if !text.is_empty() {
                    decoded.push(Message::human(text));
                }
            }
            UiRole::Assistant => decode_assistant(ui, &mut decoded),
        }
    }

    decoded
}

fn decode_assistant(ui: &UiMessage, out: &mut Vec<Message>) {
    let mut calls = Vec::new();
    let mut results = Vec::new();

    for part in &ui.parts {
        let UiMessagePart::Tool {
            tool_call_id,
            tool_name,
            state,
            input,
            output,
            error_text,
        } = part
        else {
            continue;
        };

        if !state.is_resolved() {
            tracing::debug!(
                tool_call_id = %tool_call_id,
                state = ?state,
                "Dropping unresolved tool part from client history"
            );
            continue;
        }

        let call = ToolCall::new(
            tool_call_id.clone(),
            tool_name.clone(),
            input.clone().unwrap_or_else(|| Value::Object(Default::default())),
        );
        let content = match (output, error_text) {
            (Some(Value::String(s)), _) => s.clone(),
            (Some(other), _) => other.to_string(),
            (None, Some(text)) => text.clone(),
            (None, None) => String::new(),
        };
        let result = match state {
            ToolState::OutputError => ToolResult::error(&call, content),
            ToolState::OutputDenied => ToolResult::denied(&call, content),
            _ => ToolResult::success(&call, content),
        };
        calls.push(call);
        results.push(result);
    }

    let text = ui.text_content();
    if text.is_empty() && calls.is_empty() {
        return;
    }
    out.push(Message::Ai(AiResponse::with_tool_calls(text, calls)));
    out.extend(results.into_iter().map(Message::ToolResult));
}
