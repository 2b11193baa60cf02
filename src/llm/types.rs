//! Common types for model interactions

use crate::history::{AiResponse, Message};
use serde::{Deserialize, Serialize};

/// Model request: the full ordered history plus the tools on offer
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Model response
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: AiResponse,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn new(message: AiResponse) -> Self {
        Self {
            message,
            usage: Usage::default(),
        }
    }
}

/// Usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
