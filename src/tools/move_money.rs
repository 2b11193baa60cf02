//! Money transfer tool
//!
//! Always gated: a human must approve each transfer before it runs.

use super::{Tool, ToolContext, ToolOutput, NO_REASON};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct MoveMoneyTool;

#[derive(Debug, Deserialize)]
struct MoveMoneyInput {
    amount: f64,
    recipient: String,
}

#[async_trait]
impl Tool for MoveMoneyTool {
    fn name(&self) -> &'static str {
        "moveMoney"
    }

    fn description(&self) -> String {
        "Transfer money to a recipient. Use this when the user wants to send or transfer money."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["amount", "recipient"],
            "properties": {
                "amount": {
                    "type": "number",
                    "description": "The amount of money to transfer in dollars"
                },
                "recipient": {
                    "type": "string",
                    "description": "The name or account of the recipient"
                }
            }
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn denial_message(&self, reason: Option<&str>) -> String {
        format!("Transfer denied by user: {}", reason.unwrap_or(NO_REASON))
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: MoveMoneyInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let transaction_id = format!("TXN-{}", chrono::Utc::now().timestamp_millis());
        tracing::info!(
            thread_id = %ctx.thread_id,
            recipient = %input.recipient,
            amount = input.amount,
            transaction_id = %transaction_id,
            "Transfer executed"
        );

        ToolOutput::success(format!(
            "Successfully transferred ${} to {}. Transaction ID: {transaction_id}",
            format_amount(input.amount),
            input.recipient
        ))
    }
}

/// Grouped thousands, at most three fraction digits
fn format_amount(amount: f64) -> String {
    let rounded = (amount * 1000.0).round() / 1000.0;
    let text = format!("{rounded:.3}");
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let (sign, digits) = match whole.strip_prefix('-') {
        Some(d) => ("-", d),
        None => ("", whole),
    };

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{frac}")
    }
}
