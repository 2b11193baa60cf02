//! Pure state transition function
//!
//! Given the same state, context and event this always produces the same
//! new state and effects, with no I/O.

use super::effect::Notification;
use super::state::{ApprovalDecision, Checkpoint};
use super::{ConvContext, ConvState, Effect, Event};
use crate::history::{ToolCall, ToolResult};
use std::time::Duration;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// Place `effects` ahead of the ones already queued
    fn preceded_by(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        let mut all: Vec<Effect> = effects.into_iter().collect();
        all.append(&mut self.effects);
        self.effects = all;
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Agent is busy, cannot accept message")]
    AgentBusy,
    #[error("Tool call {tool_call_id} is awaiting approval")]
    ApprovalPending { tool_call_id: String },
    #[error("Decision is for {got}, but the pending tool call is {expected}")]
    DecisionMismatch { expected: String, got: String },
    #[error("Request contained no messages")]
    EmptyMessage,
    #[error("Thread is terminated: {0}")]
    Terminated(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(
    state: &ConvState,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Terminal state
        // ============================================================
        (ConvState::Terminated { reason }, _) => Err(TransitionError::Terminated(reason.clone())),

        // ============================================================
        // User Message Handling
        // ============================================================
        (ConvState::Idle | ConvState::Error { .. }, Event::UserMessage { messages }) => {
            if messages.is_empty() {
                return Err(TransitionError::EmptyMessage);
            }
            Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: 1 })
                .with_effects(Effect::persist_messages(messages))
                .with_effect(Effect::PersistState)
                .with_effect(Effect::RequestLlm))
        }

        (
            ConvState::LlmRequesting { .. }
            | ConvState::ToolDispatching { .. }
            | ConvState::Cancelling { .. },
            Event::UserMessage { .. },
        ) => Err(TransitionError::AgentBusy),

        (ConvState::AwaitingApproval { pending, .. }, Event::UserMessage { .. }) => {
            Err(TransitionError::ApprovalPending {
                tool_call_id: pending.id.clone(),
            })
        }

        // ============================================================
        // Model Response Processing
        // ============================================================
        (ConvState::LlmRequesting { .. }, Event::LlmResponse { response }) => {
            let calls = response.tool_calls.clone();
            let head = [
                Effect::persist_ai_message(response.clone()),
                Effect::Notify(Notification::ModelResponded { response }),
            ];

            if calls.is_empty() {
                Ok(TransitionResult::new(ConvState::Idle)
                    .with_effects(head)
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::notify_turn_finished()))
            } else {
                Ok(advance_batch(context, calls).preceded_by(head))
            }
        }

        (
            ConvState::LlmRequesting { attempt },
            Event::LlmError {
                message,
                error_kind,
                attempt: failed_attempt,
            },
        ) if *attempt == failed_attempt => {
            if error_kind.is_retryable() && *attempt < context.max_llm_attempts {
                let next = attempt + 1;
                Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: next })
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::ScheduleRetry {
                        delay: retry_delay(context.retry_base_delay, *attempt),
                        attempt: next,
                    }))
            } else {
                Ok(TransitionResult::new(ConvState::Error {
                    message: message.clone(),
                    error_kind,
                })
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_failed(message)))
            }
        }

        (ConvState::LlmRequesting { attempt }, Event::RetryTimeout { attempt: retry })
            if *attempt == retry =>
        {
            Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: retry })
                .with_effect(Effect::RequestLlm))
        }

        // ============================================================
        // Tool Dispatch
        // ============================================================
        (ConvState::ToolDispatching { batch, remaining }, Event::ToolsCompleted { results }) => {
            ensure_results_match(batch, &results)?;
            Ok(advance_batch(context, remaining.clone()).preceded_by(record_results(results)))
        }

        // ============================================================
        // Approval Gate
        // ============================================================
        (
            ConvState::AwaitingApproval { pending, remaining },
            Event::ApprovalDecision { decision },
        ) => {
            if decision.tool_call_id != pending.id {
                return Err(TransitionError::DecisionMismatch {
                    expected: pending.id.clone(),
                    got: decision.tool_call_id,
                });
            }

            let next = ConvState::ToolDispatching {
                batch: vec![pending.clone()],
                remaining: remaining.clone(),
            };
            let work = if decision.approved {
                Effect::DispatchTools {
                    calls: vec![pending.clone()],
                }
            } else {
                Effect::DenyTools {
                    calls: vec![pending.clone()],
                    reason: decision.reason,
                }
            };
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PersistState)
                .with_effect(work))
        }

        (ConvState::AwaitingApproval { pending, remaining }, Event::Cancel { reason }) => {
            let batch: Vec<ToolCall> = std::iter::once(pending.clone())
                .chain(remaining.iter().cloned())
                .collect();
            Ok(TransitionResult::new(ConvState::Cancelling {
                batch: batch.clone(),
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::DenyTools {
                calls: batch,
                reason: Some(reason),
            }))
        }

        (ConvState::Cancelling { batch }, Event::ToolsCompleted { results }) => {
            ensure_results_match(batch, &results)?;
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effects(record_results(results))
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_turn_finished()))
        }

        // ============================================================
        // Invariant Violations
        // ============================================================
        (_, Event::HistoryInvalid { message }) => {
            Ok(TransitionResult::new(ConvState::Terminated {
                reason: message.clone(),
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::notify_failed(message)))
        }

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{} cannot handle {}",
            state.name(),
            event.name()
        ))),
    }
}

/// Resume a suspended turn from its checkpoint
pub fn resume(
    checkpoint: &Checkpoint,
    context: &ConvContext,
    decision: ApprovalDecision,
) -> Result<TransitionResult, TransitionError> {
    transition(&checkpoint.state(), context, Event::ApprovalDecision { decision })
}

/// Walk the rest of a batch: suspend on the first gated call, otherwise
/// dispatch the contiguous run of ungated calls ahead of it.
fn advance_batch(context: &ConvContext, calls: Vec<ToolCall>) -> TransitionResult {
    let Some(first) = calls.first() else {
        return TransitionResult::new(ConvState::LlmRequesting { attempt: 1 })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::RequestLlm);
    };

    if context.is_gated(&first.name) {
        let mut remaining = calls;
        let pending = remaining.remove(0);
        return TransitionResult::new(ConvState::AwaitingApproval {
            pending: pending.clone(),
            remaining: remaining.clone(),
        })
        .with_effect(Effect::SaveCheckpoint {
            pending: pending.clone(),
            remaining,
        })
        .with_effect(Effect::PersistState)
        .with_effect(Effect::Notify(Notification::Suspended { pending }));
    }

    let split = calls
        .iter()
        .position(|c| context.is_gated(&c.name))
        .unwrap_or(calls.len());
    let mut batch = calls;
    let remaining = batch.split_off(split);

    TransitionResult::new(ConvState::ToolDispatching {
        batch: batch.clone(),
        remaining,
    })
    .with_effect(Effect::PersistState)
    .with_effect(Effect::DispatchTools { calls: batch })
}

fn record_results(results: Vec<ToolResult>) -> Vec<Effect> {
    let mut effects: Vec<Effect> = Effect::notify_resolved(&results).collect();
    effects.insert(0, Effect::PersistToolResults { results });
    effects
}

fn ensure_results_match(batch: &[ToolCall], results: &[ToolResult]) -> Result<(), TransitionError> {
    let expected = batch.iter().map(|c| c.id.as_str());
    let got = results.iter().map(|r| r.tool_call_id.as_str());
    if expected.eq(got) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(format!(
            "results {:?} do not answer batch {:?}",
            results.iter().map(|r| &r.tool_call_id).collect::<Vec<_>>(),
            batch.iter().map(|c| &c.id).collect::<Vec<_>>()
        )))
    }
}

/// Exponential backoff: base, 2x base, 4x base, ...
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * (1 << attempt.saturating_sub(1).min(16))
}
