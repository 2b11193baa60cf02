//! Session event translation
//!
//! Turns the notifications of one streaming session into the ordered
//! [`ExternalEvent`] stream sent to the client. Input events are only ever
//! produced for tool calls the model requested during the session; calls
//! resolved in earlier sessions are omitted or replayed as finished pairs.

mod ui_message;

#[cfg(test)]
mod proptests;

pub use ui_message::{decode_ui_messages, encode_history, ToolState, UiMessage, UiMessagePart, UiRole};

use crate::history::{MessageHistory, ToolCall, ToolOutcome, ToolResult};
use crate::state_machine::Notification;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Reason attached to inputs left open when a turn ends abnormally
pub const TURN_ABORTED: &str = "turn aborted";

/// Events streamed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExternalEvent {
    TurnStart {
        #[serde(rename = "threadId")]
        thread_id: String,
    },

    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },

    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },

    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
        #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    ToolDenied {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        reason: String,
    },

    /// A call resolved before this session, replayed as one finished pair
    HistoricalTool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
        output: Value,
        outcome: ToolOutcome,
    },

    TextDelta {
        delta: String,
    },

    /// The session stopped on a gated call; ends the stream
    Suspended {
        #[serde(rename = "pendingToolCallId")]
        pending_tool_call_id: String,
    },

    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },

    TurnEnd,
}

impl ExternalEvent {
    /// True for the events that close a session's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExternalEvent::TurnEnd | ExternalEvent::Suspended { .. })
    }

    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ExternalEvent::TurnStart { .. } => "turn-start",
            ExternalEvent::ToolInputStart { .. } => "tool-input-start",
            ExternalEvent::ToolInputAvailable { .. } => "tool-input-available",
            ExternalEvent::ToolOutputAvailable { .. } => "tool-output-available",
            ExternalEvent::ToolDenied { .. } => "tool-denied",
            ExternalEvent::HistoricalTool { .. } => "historical-tool",
            ExternalEvent::TextDelta { .. } => "text-delta",
            ExternalEvent::Suspended { .. } => "suspended",
            ExternalEvent::Error { .. } => "error",
            ExternalEvent::TurnEnd => "turn-end",
        }
    }

    fn output_for(result: &ToolResult) -> Self {
        match result.outcome {
            ToolOutcome::Denied => ExternalEvent::ToolDenied {
                tool_call_id: result.tool_call_id.clone(),
                reason: result.content.clone(),
            },
            ToolOutcome::Success | ToolOutcome::Error => ExternalEvent::ToolOutputAvailable {
                tool_call_id: result.tool_call_id.clone(),
                output: Value::String(result.content.clone()),
                is_error: result.is_error(),
            },
        }
    }
}

/// How calls resolved in earlier sessions show up in a new stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Leave them out of the delta stream
    #[default]
    Omit,
    /// Emit each as a single [`ExternalEvent::HistoricalTool`]
    Paired,
}

/// Per-session translator
#[derive(Debug)]
pub struct EventTranslator {
    thread_id: String,
    /// Calls answered before the session began, across the whole history
    historical: HashSet<String>,
    /// Calls still open from an earlier session; their inputs were delivered then
    carried: HashSet<String>,
    /// Calls given input events in this session
    started: HashSet<String>,
    /// Calls given an output event in this session
    answered: HashSet<String>,
    /// Inputs delivered this session still waiting for an output, in request order
    open: Vec<String>,
    replay: Vec<ExternalEvent>,
    finished: bool,
}

impl EventTranslator {
    /// Build a translator for a session over `history` as it stood at session start
    pub fn new(thread_id: impl Into<String>, history: &MessageHistory, mode: ReplayMode) -> Self {
        let replay = match mode {
            ReplayMode::Omit => Vec::new(),
            ReplayMode::Paired => history
                .tool_results()
                .filter_map(|result| {
                    history.find_call(&result.tool_call_id).map(|call| ExternalEvent::HistoricalTool {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        input: call.args.clone(),
                        output: Value::String(result.content.clone()),
                        outcome: result.outcome,
                    })
                })
                .collect(),
        };

        Self {
            thread_id: thread_id.into(),
            historical: history.resolved_call_ids(),
            carried: history.unresolved_calls().into_iter().map(|c| c.id).collect(),
            started: HashSet::new(),
            answered: HashSet::new(),
            open: Vec::new(),
            replay,
            finished: false,
        }
    }

    /// Events that open the stream
    pub fn begin(&mut self) -> Vec<ExternalEvent> {
        let mut events = vec![ExternalEvent::TurnStart {
            thread_id: self.thread_id.clone(),
        }];
        events.append(&mut self.replay);
        events
    }

    pub fn translate(&mut self, notification: &Notification) -> Vec<ExternalEvent> {
        if self.finished {
            return Vec::new();
        }

        match notification {
            Notification::ModelResponded { response } => {
                let mut events = Vec::new();
                if !response.text.is_empty() {
                    events.push(ExternalEvent::TextDelta {
                        delta: response.text.clone(),
                    });
                }
                for call in &response.tool_calls {
                    events.extend(self.input_events(call));
                }
                events
            }
            Notification::ToolResolved { result } => self.output_event(result).into_iter().collect(),
            Notification::Suspended { pending } => {
                self.finished = true;
                vec![ExternalEvent::Suspended {
                    pending_tool_call_id: pending.id.clone(),
                }]
            }
            Notification::TurnFinished => self.finish(None),
            Notification::Failed { message } => self.finish(Some(message)),
        }
    }

    /// Close the stream after a failure outside the state machine
    pub fn abort(&mut self, message: &str) -> Vec<ExternalEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finish(Some(message))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn input_events(&mut self, call: &ToolCall) -> Vec<ExternalEvent> {
        if self.historical.contains(&call.id) || self.carried.contains(&call.id) {
            tracing::warn!(
                thread_id = %self.thread_id,
                tool_call_id = %call.id,
                "Suppressed input events for a call from an earlier session"
            );
            return Vec::new();
        }
        if !self.started.insert(call.id.clone()) {
            return Vec::new();
        }

        self.open.push(call.id.clone());
        vec![
            ExternalEvent::ToolInputStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            },
            ExternalEvent::ToolInputAvailable {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input: call.args.clone(),
            },
        ]
    }

    fn output_event(&mut self, result: &ToolResult) -> Option<ExternalEvent> {
        let id = &result.tool_call_id;
        if self.historical.contains(id) || !self.answered.insert(id.clone()) {
            return None;
        }

        if let Some(pos) = self.open.iter().position(|open| open == id) {
            self.open.remove(pos);
        } else {
            self.carried.remove(id);
        }
        Some(ExternalEvent::output_for(result))
    }

    fn finish(&mut self, error: Option<&str>) -> Vec<ExternalEvent> {
        let mut events: Vec<ExternalEvent> = self
            .open
            .drain(..)
            .map(|tool_call_id| {
                tracing::warn!(
                    thread_id = %self.thread_id,
                    tool_call_id = %tool_call_id,
                    "Closing unanswered tool input at turn end"
                );
                ExternalEvent::ToolDenied {
                    tool_call_id,
                    reason: TURN_ABORTED.to_string(),
                }
            })
            .collect();

        if let Some(message) = error {
            events.push(ExternalEvent::Error {
                error_text: message.to_string(),
            });
        }
        events.push(ExternalEvent::TurnEnd);
        self.finished = true;
        events
    }
}

/// Ways an event stream can break input/output pairing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamViolation {
    #[error("input for {0} was emitted twice")]
    DuplicateInput(String),
    #[error("output for {0} was emitted twice")]
    DuplicateOutput(String),
    #[error("output for {0} precedes its input")]
    OutputBeforeInput(String),
    #[error("input for {0} has no output before turn end")]
    UnpairedInput(String),
    #[error("event after the end of the stream")]
    EventAfterEnd,
}

/// Check a complete session stream for pairing.
///
/// Every `ToolInputAvailable` must get exactly one output before `TurnEnd`.
/// A stream that ends in `Suspended` may leave inputs open.
pub fn verify_stream(events: &[ExternalEvent]) -> Result<(), StreamViolation> {
    let mut inputs: Vec<&str> = Vec::new();
    let mut outputs: HashSet<&str> = HashSet::new();
    let mut ended = false;

    for event in events {
        if ended {
            return Err(StreamViolation::EventAfterEnd);
        }
        match event {
            ExternalEvent::ToolInputAvailable { tool_call_id, .. } => {
                if inputs.contains(&tool_call_id.as_str()) {
                    return Err(StreamViolation::DuplicateInput(tool_call_id.clone()));
                }
                if outputs.contains(tool_call_id.as_str()) {
                    return Err(StreamViolation::OutputBeforeInput(tool_call_id.clone()));
                }
                inputs.push(tool_call_id);
            }
            ExternalEvent::ToolOutputAvailable { tool_call_id, .. }
            | ExternalEvent::ToolDenied { tool_call_id, .. } => {
                if !outputs.insert(tool_call_id) {
                    return Err(StreamViolation::DuplicateOutput(tool_call_id.clone()));
                }
            }
            ExternalEvent::TurnEnd => {
                if let Some(open) = inputs.iter().find(|id| !outputs.contains(*id)) {
                    return Err(StreamViolation::UnpairedInput((*open).to_string()));
                }
                ended = true;
            }
            ExternalEvent::Suspended { .. } => ended = true,
            _ => {}
        }
    }
    Ok(())
}
