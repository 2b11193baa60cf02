//! Turn executor
//!
//! One model call over the full history, interpreted as either a final answer
//! or a batch of tool calls in the order the model returned them.

use crate::history::{AiResponse, MessageHistory, PairingViolation, ToolCall};
use crate::llm::{LlmError, ModelClient, ModelRequest, ToolDefinition};
use crate::tools::ToolRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// What a single model call produced
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Finalized { text: String },
    ToolsRequested { text: String, calls: Vec<ToolCall> },
}

impl TurnOutcome {
    fn from_response(response: AiResponse) -> Self {
        if response.has_tool_calls() {
            TurnOutcome::ToolsRequested {
                text: response.text,
                calls: response.tool_calls,
            }
        } else {
            TurnOutcome::Finalized {
                text: response.text,
            }
        }
    }

    /// The model message to append to the history
    pub fn into_response(self) -> AiResponse {
        match self {
            TurnOutcome::Finalized { text } => AiResponse::text(text),
            TurnOutcome::ToolsRequested { text, calls } => AiResponse::with_tool_calls(text, calls),
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    /// The history must never reach the model in this shape
    #[error("History invariant violated: {0}")]
    InvalidHistory(#[from] PairingViolation),
    #[error("Model invocation failed: {0}")]
    Model(#[from] LlmError),
}

pub struct TurnExecutor<M: ModelClient> {
    model: Arc<M>,
    tools: Vec<ToolDefinition>,
}

impl<M: ModelClient> TurnExecutor<M> {
    pub fn new(model: Arc<M>, registry: &ToolRegistry) -> Self {
        Self {
            model,
            tools: registry.definitions(),
        }
    }

    pub async fn run_turn(&self, history: &MessageHistory) -> Result<TurnOutcome, TurnError> {
        history.ensure_ready_for_model()?;

        let request = ModelRequest {
            messages: history.snapshot(),
            tools: self.tools.clone(),
        };
        let response = self.model.invoke(&request).await?;
        check_call_ids(history, &response.message)?;
        Ok(TurnOutcome::from_response(response.message))
    }
}

/// Every requested call needs a non-empty id unique across the whole history
fn check_call_ids(history: &MessageHistory, response: &AiResponse) -> Result<(), LlmError> {
    let mut seen: HashSet<&str> = history.tool_calls().map(|c| c.id.as_str()).collect();
    for call in &response.tool_calls {
        if call.id.is_empty() {
            return Err(LlmError::invalid_request(format!(
                "model returned a call to {} without an id",
                call.name
            )));
        }
        if !seen.insert(call.id.as_str()) {
            return Err(LlmError::invalid_request(format!(
                "model reused tool call id {}",
                call.id
            )));
        }
    }
    Ok(())
}
