//! Maths tool - multiplies its input by a random number

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct MathsTool;

#[derive(Debug, Deserialize)]
struct MathsInput {
    input: f64,
}

#[async_trait]
impl Tool for MathsTool {
    fn name(&self) -> &'static str {
        "maths"
    }

    fn description(&self) -> String {
        "Use this tool to solve math problems. If the user says do maths, you should use this tool."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["input"],
            "properties": {
                "input": { "type": "number" }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        match serde_json::from_value::<MathsInput>(input) {
            Ok(MathsInput { input }) => {
                let product = rand::random::<f64>() * input;
                ToolOutput::success(format!("{product} is a random number times {input}"))
            }
            Err(e) => ToolOutput::error(format!("Invalid input: {e}")),
        }
    }
}
