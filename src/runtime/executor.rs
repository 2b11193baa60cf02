//! Conversation runtime executor
//!
//! Runs one session of a thread: feeds events through the pure transition
//! function, executes the resulting effects, and streams translated events
//! until the thread is quiescent (idle, suspended, failed or terminated).

use super::traits::Storage;
use super::turn::{TurnError, TurnExecutor};
use crate::history::{Message, ToolResult};
use crate::llm::{LlmErrorKind, ModelClient};
use crate::state_machine::{
    transition, Checkpoint, ConvContext, ConvState, Effect, Event, TransitionResult,
};
use crate::tools::{ToolContext, ToolRegistry};
use crate::translator::{EventTranslator, ExternalEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result content for calls left unanswered by a failed session
const INTERRUPTED_RESULT: &str = "Tool call was interrupted by an internal error";

/// Generic session runtime that can work with any storage and model implementation
pub struct ConversationRuntime<S, M>
where
    S: Storage,
    M: ModelClient,
{
    context: ConvContext,
    state: ConvState,
    storage: S,
    turns: TurnExecutor<M>,
    tools: Arc<ToolRegistry>,
    translator: EventTranslator,
    events_tx: mpsc::Sender<ExternalEvent>,
    /// Handed to tools; cancelled on shutdown
    cancel: CancellationToken,
}

impl<S, M> ConversationRuntime<S, M>
where
    S: Storage,
    M: ModelClient,
{
    pub fn new(
        context: ConvContext,
        storage: S,
        turns: TurnExecutor<M>,
        tools: Arc<ToolRegistry>,
        translator: EventTranslator,
        events_tx: mpsc::Sender<ExternalEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            // Replaced by the first transition in `run`
            state: ConvState::default(),
            storage,
            turns,
            tools,
            translator,
            events_tx,
            cancel,
        }
    }

    /// Run the session from its first transition until quiescent.
    /// Returns the state the thread was left in.
    pub async fn run(mut self, first: TransitionResult) -> ConvState {
        let thread_id = self.context.thread_id.clone();
        tracing::info!(thread_id = %thread_id, state = %first.new_state.name(), "Starting session");

        let opening = self.translator.begin();
        self.emit_all(opening).await;

        if let Err(e) = self.process(first).await {
            tracing::error!(thread_id = %thread_id, state = %self.state.name(), error = %e, "Session failed");
            let closing = self.translator.abort(&e);
            self.emit_all(closing).await;
            self.settle_after_failure(&e).await;
        }

        tracing::info!(thread_id = %thread_id, state = %self.state.name(), "Session finished");
        self.state
    }

    async fn process(&mut self, first: TransitionResult) -> Result<(), String> {
        // Chained events are processed in a loop, not recursively
        let mut events_to_process = self.apply(first).await?;

        while let Some(event) = events_to_process.pop() {
            tracing::debug!(
                thread_id = %self.context.thread_id,
                state = %self.state.name(),
                event = %event.name(),
                "Processing event"
            );
            let result = transition(&self.state, &self.context, event).map_err(|e| e.to_string())?;
            events_to_process.extend(self.apply(result).await?);
        }

        Ok(())
    }

    async fn apply(&mut self, result: TransitionResult) -> Result<Vec<Event>, String> {
        self.state = result.new_state;

        let mut generated = Vec::new();
        for effect in result.effects {
            if let Some(event) = self.execute_effect(effect).await? {
                generated.push(event);
            }
        }
        Ok(generated)
    }

    /// Execute an effect and optionally return a generated event
    async fn execute_effect(&mut self, effect: Effect) -> Result<Option<Event>, String> {
        let thread_id = self.context.thread_id.clone();

        match effect {
            Effect::PersistMessage { message } => {
                self.storage
                    .append_messages(&thread_id, std::slice::from_ref(&message))
                    .await?;
                Ok(None)
            }

            Effect::PersistToolResults { results } => {
                let messages: Vec<Message> = results.into_iter().map(Message::ToolResult).collect();
                self.storage.append_messages(&thread_id, &messages).await?;
                Ok(None)
            }

            Effect::PersistState => {
                self.storage.update_state(&thread_id, &self.state).await?;
                Ok(None)
            }

            Effect::RequestLlm => {
                let attempt = match &self.state {
                    ConvState::LlmRequesting { attempt } => *attempt,
                    _ => 1,
                };
                let history = self.storage.get_history(&thread_id).await?;

                tracing::info!(
                    thread_id = %thread_id,
                    attempt,
                    history_len = history.len(),
                    "Requesting model turn"
                );

                let event = match self.turns.run_turn(&history).await {
                    Ok(outcome) => Event::LlmResponse {
                        response: outcome.into_response(),
                    },
                    Err(TurnError::InvalidHistory(violation)) => {
                        tracing::error!(
                            thread_id = %thread_id,
                            violation = %violation,
                            "Refusing to send malformed history to the model"
                        );
                        Event::HistoryInvalid {
                            message: violation.to_string(),
                        }
                    }
                    Err(TurnError::Model(e)) => Event::LlmError {
                        message: e.message,
                        error_kind: e.kind,
                        attempt,
                    },
                };
                Ok(Some(event))
            }

            Effect::DispatchTools { calls } => {
                tracing::info!(
                    thread_id = %thread_id,
                    tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "Dispatching tools"
                );
                let ctx = ToolContext::new(self.cancel.child_token(), thread_id);
                let results = self.tools.dispatch_all(&calls, &ctx).await;
                Ok(Some(Event::ToolsCompleted { results }))
            }

            Effect::DenyTools { calls, reason } => {
                let results = calls
                    .iter()
                    .map(|call| {
                        tracing::info!(
                            thread_id = %thread_id,
                            tool = %call.name,
                            tool_call_id = %call.id,
                            reason = ?reason,
                            "Tool call denied"
                        );
                        self.tools.denial_result(call, reason.as_deref())
                    })
                    .collect();
                Ok(Some(Event::ToolsCompleted { results }))
            }

            Effect::SaveCheckpoint { pending, remaining } => {
                let history = self.storage.get_history(&thread_id).await?;
                let checkpoint = Checkpoint {
                    thread_id: thread_id.clone(),
                    history_len: history.len(),
                    pending,
                    remaining,
                    created_at: Utc::now(),
                };
                self.storage.save_checkpoint(&checkpoint).await?;
                tracing::info!(
                    thread_id = %thread_id,
                    tool_call_id = %checkpoint.pending.id,
                    tool = %checkpoint.pending.name,
                    history_len = checkpoint.history_len,
                    "Suspended awaiting approval"
                );
                Ok(None)
            }

            Effect::ScheduleRetry { delay, attempt } => {
                tracing::warn!(
                    thread_id = %thread_id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    "Retrying model request"
                );
                tokio::time::sleep(delay).await;
                Ok(Some(Event::RetryTimeout { attempt }))
            }

            Effect::Notify(notification) => {
                let events = self.translator.translate(&notification);
                self.emit_all(events).await;
                Ok(None)
            }
        }
    }

    /// Leave storage in a state later requests can work with after `process`
    /// failed part way. Mirrors startup recovery for a single thread.
    async fn settle_after_failure(&mut self, error: &str) {
        match self.repair(error).await {
            Ok(state) => self.state = state,
            Err(e) => {
                tracing::error!(
                    thread_id = %self.context.thread_id,
                    error = %e,
                    "Failed to repair thread after session failure"
                );
                if let Ok(Some(stored)) = self.storage.get_state(&self.context.thread_id).await {
                    self.state = stored;
                }
            }
        }
    }

    async fn repair(&self, error: &str) -> Result<ConvState, String> {
        let thread_id = &self.context.thread_id;

        let state = if let ConvState::Terminated { .. } = self.state {
            self.state.clone()
        } else if let Some(checkpoint) = self.storage.get_checkpoint(thread_id).await? {
            checkpoint.state()
        } else {
            let history = self.storage.get_history(thread_id).await?;
            let orphans: Vec<Message> = history
                .unresolved_calls()
                .iter()
                .map(|call| Message::ToolResult(ToolResult::error(call, INTERRUPTED_RESULT)))
                .collect();
            if !orphans.is_empty() {
                self.storage.append_messages(thread_id, &orphans).await?;
            }
            ConvState::Error {
                message: error.to_string(),
                error_kind: LlmErrorKind::Unknown,
            }
        };

        self.storage.update_state(thread_id, &state).await?;
        tracing::info!(thread_id = %thread_id, state = %state.name(), "Thread settled after session failure");
        Ok(state)
    }

    /// The session keeps running if the client has gone away
    async fn emit_all(&self, events: Vec<ExternalEvent>) {
        for event in events {
            if self.events_tx.send(event).await.is_err() {
                tracing::debug!(thread_id = %self.context.thread_id, "Event stream receiver dropped");
                return;
            }
        }
    }
}
