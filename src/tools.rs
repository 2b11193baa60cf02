//! Tool registry and dispatch
//!
//! Tools are stateless singletons registered once at startup. Every call the
//! model makes is resolved into a [`ToolResult`]; lookup, validation and
//! execution failures become error results rather than propagating.

mod maths;
mod move_money;

pub use maths::MathsTool;
pub use move_money::MoveMoneyTool;

use crate::history::{ToolCall, ToolResult};
use crate::llm::ToolDefinition;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// Per-call context handed to a tool
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,
    /// The thread this call belongs to
    pub thread_id: String,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, thread_id: impl Into<String>) -> Self {
        Self {
            cancel,
            thread_id: thread_id.into(),
        }
    }
}

/// Trait for tools the model may call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Whether every call must be approved by a human before it runs
    fn requires_approval(&self) -> bool {
        false
    }

    /// Result content recorded when a human denies a call
    fn denial_message(&self, reason: Option<&str>) -> String {
        format!(
            "Tool call to {} denied by user: {}",
            self.name(),
            reason.unwrap_or(NO_REASON)
        )
    }

    /// Execute with already validated input
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

const NO_REASON: &str = "No reason provided";

/// Failures while resolving a single tool call
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),
    #[error("Invalid arguments for {tool}: {}", errors.join("; "))]
    SchemaValidation { tool: String, errors: Vec<String> },
    #[error("Tool {tool} failed: {message}")]
    Execution { tool: String, message: String },
    #[error("Tool {tool} has an invalid input schema: {message}")]
    InvalidSchema { tool: String, message: String },
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
}

impl RegisteredTool {
    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        if self.validator.is_valid(args) {
            return Ok(());
        }
        let errors = self
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        Err(ToolError::SchemaValidation {
            tool: self.tool.name().to_string(),
            errors,
        })
    }
}

/// Builder used at startup; the built registry cannot be modified
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistryBuilder {
    /// Register a tool, compiling its schema
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Result<Self, ToolError> {
        let validator =
            jsonschema::Validator::new(&tool.input_schema()).map_err(|e| ToolError::InvalidSchema {
                tool: tool.name().to_string(),
                message: e.to_string(),
            })?;

        if let Some(pos) = self.tools.iter().position(|t| t.tool.name() == tool.name()) {
            tracing::warn!(tool = %tool.name(), "Replacing previously registered tool");
            self.tools.remove(pos);
        }
        self.tools.push(RegisteredTool { tool, validator });
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        let index = self
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.tool.name().to_string(), i))
            .collect();
        ToolRegistry {
            tools: self.tools,
            index,
        }
    }
}

/// Read-only collection of tools available to conversations
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Registry with the built-in tools
    pub fn standard() -> Result<Self, ToolError> {
        Ok(Self::builder()
            .register(Arc::new(MathsTool))?
            .register(Arc::new(MoveMoneyTool))?
            .build())
    }

    fn entry(&self, name: &str) -> Result<&RegisteredTool, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.entry(name).map(|e| Arc::clone(&e.tool))
    }

    /// Unknown tools are never gated; they resolve to an error result instead
    pub fn requires_approval(&self, name: &str) -> bool {
        self.entry(name).is_ok_and(|e| e.tool.requires_approval())
    }

    /// Names of all gated tools
    pub fn gated_tools(&self) -> HashSet<String> {
        self.tools
            .iter()
            .filter(|t| t.tool.requires_approval())
            .map(|t| t.tool.name().to_string())
            .collect()
    }

    /// Get all tool definitions for the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.tool.name().to_string(),
                description: t.tool.description(),
                input_schema: t.tool.input_schema(),
            })
            .collect()
    }

    /// Denial content for a call the user rejected
    pub fn denial_result(&self, call: &ToolCall, reason: Option<&str>) -> ToolResult {
        let content = match self.entry(&call.name) {
            Ok(entry) => entry.tool.denial_message(reason),
            Err(_) => format!(
                "Tool call to {} denied by user: {}",
                call.name,
                reason.unwrap_or(NO_REASON)
            ),
        };
        ToolResult::denied(call, content)
    }

    /// Resolve one call; never fails
    pub async fn dispatch(&self, call: &ToolCall, ctx: ToolContext) -> ToolResult {
        let thread_id = ctx.thread_id.clone();
        match self.try_dispatch(call, ctx).await {
            Ok(content) => ToolResult::success(call, content),
            Err(e) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    tool = %call.name,
                    tool_call_id = %call.id,
                    error = %e,
                    "Tool call resolved as error"
                );
                ToolResult::error(call, e.to_string())
            }
        }
    }

    /// Resolve calls concurrently; results come back in request order
    pub async fn dispatch_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        futures::future::join_all(calls.iter().map(|call| self.dispatch(call, ctx.clone()))).await
    }

    async fn try_dispatch(&self, call: &ToolCall, ctx: ToolContext) -> Result<String, ToolError> {
        let entry = self.entry(&call.name)?;
        entry.validate(&call.args)?;

        let run = entry.tool.run(call.args.clone(), ctx);
        let output = AssertUnwindSafe(run)
            .catch_unwind()
            .await
            .map_err(|_| ToolError::Execution {
                tool: call.name.clone(),
                message: "tool panicked".to_string(),
            })?;

        if output.success {
            Ok(output.output)
        } else {
            Err(ToolError::Execution {
                tool: call.name.clone(),
                message: output.output,
            })
        }
    }
}
