//! Runtime for executing conversations
//!
//! The [`Orchestrator`] accepts requests for a thread, validates them against
//! the persisted state, and starts a session ([`ConversationRuntime`]) whose
//! events are streamed back through a [`SessionHandle`].

mod executor;
mod lease;
pub mod traits;
mod turn;


pub use executor::ConversationRuntime;
pub use traits::*;
pub use turn::{TurnError, TurnExecutor, TurnOutcome};

use crate::history::{Message, MessageHistory};
use crate::llm::{LoggingClient, ModelClient, OpenAIClient};
use crate::state_machine::{
    resume, transition, ApprovalDecision, Checkpoint, ConvContext, ConvState, Event,
    ExecutionStatus, TransitionError, TransitionResult, DEFAULT_MAX_LLM_ATTEMPTS,
};
use crate::tools::ToolRegistry;
use crate::translator::{EventTranslator, ExternalEvent, ReplayMode};
use chrono::Utc;
use lease::{ThreadLease, ThreadLeases};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Type alias for the production orchestrator
pub type ProductionOrchestrator = Orchestrator<DatabaseStorage, LoggingClient<OpenAIClient>>;

/// Reason recorded when a pending approval is abandoned
pub const CANCELLED: &str = "cancelled";

const EVENT_BUFFER: usize = 64;

/// Request-visible failures
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("No pending approval for thread {0}")]
    NoCheckpoint(String),
    #[error("Approval for thread {0} is already being resolved")]
    CheckpointConflict(String),
    #[error("Decision is for {got}, but the pending tool call is {expected}")]
    DecisionMismatch { expected: String, got: String },
    #[error("Thread {0} is busy")]
    ThreadBusy(String),
    #[error("Thread {thread_id} is terminated: {reason}")]
    ThreadTerminated { thread_id: String, reason: String },
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Request contained no messages")]
    EmptyRequest,
    #[error("History invariant violated: {0}")]
    HistoryInvariantViolation(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RequestError {
    fn rejected(thread_id: &str, error: TransitionError) -> Self {
        match error {
            TransitionError::AgentBusy | TransitionError::ApprovalPending { .. } => {
                RequestError::ThreadBusy(thread_id.to_string())
            }
            TransitionError::EmptyMessage => RequestError::EmptyRequest,
            TransitionError::Terminated(reason) => RequestError::ThreadTerminated {
                thread_id: thread_id.to_string(),
                reason,
            },
            TransitionError::DecisionMismatch { expected, got } => {
                RequestError::DecisionMismatch { expected, got }
            }
            TransitionError::InvalidTransition(message) => RequestError::Internal(message),
        }
    }
}

/// Inbound request for a thread
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub thread_id: Option<String>,
    pub new_messages: Vec<Message>,
    pub approval_decision: Option<ApprovalDecision>,
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_llm_attempts: u32,
    pub retry_base_delay: Duration,
    pub replay_mode: ReplayMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_llm_attempts: DEFAULT_MAX_LLM_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
            replay_mode: ReplayMode::Omit,
        }
    }
}

/// A running session
pub struct SessionHandle {
    pub thread_id: String,
    events: mpsc::Receiver<ExternalEvent>,
    task: JoinHandle<ConvState>,
}

impl SessionHandle {
    /// Stream events; the session keeps running if the stream is dropped
    pub fn into_stream(self) -> ReceiverStream<ExternalEvent> {
        ReceiverStream::new(self.events)
    }

    /// Wait for the session to end, collecting its events
    pub async fn finish(mut self) -> Result<(Vec<ExternalEvent>, ConvState), RequestError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let state = self
            .task
            .await
            .map_err(|e| RequestError::Internal(format!("session task failed: {e}")))?;
        Ok((events, state))
    }
}

/// Read-only view of a thread
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub status: ExecutionStatus,
    pub history: MessageHistory,
    pub checkpoint: Option<Checkpoint>,
}

/// Entry point for all thread operations
pub struct Orchestrator<S, M>
where
    S: Storage + Clone + 'static,
    M: ModelClient + 'static,
{
    storage: S,
    model: Arc<M>,
    tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
    leases: ThreadLeases,
    shutdown: CancellationToken,
}

impl<S, M> Orchestrator<S, M>
where
    S: Storage + Clone + 'static,
    M: ModelClient + 'static,
{
    pub fn new(storage: S, model: M, tools: ToolRegistry, config: OrchestratorConfig) -> Self {
        Self {
            storage,
            model: Arc::new(model),
            tools: Arc::new(tools),
            config,
            leases: ThreadLeases::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Route a request: a decision with a live checkpoint resumes, anything
    /// else starts a fresh turn with the new messages.
    pub async fn handle(&self, request: AgentRequest) -> Result<SessionHandle, RequestError> {
        let thread_id = request
            .thread_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(decision) = request.approval_decision {
            match self.resume(&thread_id, decision).await {
                Err(RequestError::NoCheckpoint(_)) if !request.new_messages.is_empty() => {
                    tracing::info!(
                        thread_id = %thread_id,
                        "Decision has no live checkpoint, starting a fresh turn"
                    );
                }
                outcome => return outcome,
            }
        }

        self.start_turn(&thread_id, request.new_messages).await
    }

    /// Append user messages and run a new turn
    pub async fn start_turn(
        &self,
        thread_id: &str,
        messages: Vec<Message>,
    ) -> Result<SessionHandle, RequestError> {
        if messages.is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        let lease = self
            .leases
            .try_acquire(thread_id)
            .ok_or_else(|| RequestError::ThreadBusy(thread_id.to_string()))?;

        let state = self
            .storage
            .ensure_thread(thread_id)
            .await
            .map_err(RequestError::Storage)?;
        let history = self.history(thread_id).await?;
        let context = self.context(thread_id);

        let first = transition(&state, &context, Event::UserMessage { messages })
            .map_err(|e| RequestError::rejected(thread_id, e))?;

        tracing::info!(thread_id = %thread_id, history_len = history.len(), "Starting turn");
        Ok(self.spawn_session(lease, context, &history, first))
    }

    /// Resolve the pending approval of a suspended thread
    pub async fn resume(
        &self,
        thread_id: &str,
        decision: ApprovalDecision,
    ) -> Result<SessionHandle, RequestError> {
        let lease = self
            .leases
            .try_acquire(thread_id)
            .ok_or_else(|| RequestError::CheckpointConflict(thread_id.to_string()))?;

        let state = self
            .storage
            .get_state(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .ok_or_else(|| RequestError::NoCheckpoint(thread_id.to_string()))?;
        if let ConvState::Terminated { reason } = state {
            return Err(RequestError::ThreadTerminated {
                thread_id: thread_id.to_string(),
                reason,
            });
        }

        let live = self
            .storage
            .get_checkpoint(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .ok_or_else(|| RequestError::NoCheckpoint(thread_id.to_string()))?;
        let history = self.checkpointed_history(&live).await?;
        let context = self.context(thread_id);

        // Pure, so a mismatched decision leaves the checkpoint untouched
        let first = resume(&live, &context, decision.clone())
            .map_err(|e| RequestError::rejected(thread_id, e))?;

        // Consumed before any resumed work runs; losing the race means someone else resumed
        if self
            .storage
            .take_checkpoint(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .is_none()
        {
            return Err(RequestError::CheckpointConflict(thread_id.to_string()));
        }

        tracing::info!(
            thread_id = %thread_id,
            tool_call_id = %decision.tool_call_id,
            approved = decision.approved,
            "Resuming from checkpoint"
        );
        Ok(self.spawn_session(lease, context, &history, first))
    }

    /// Abandon a pending approval; every call left in the batch is denied
    pub async fn cancel(&self, thread_id: &str, reason: &str) -> Result<SessionHandle, RequestError> {
        let lease = self
            .leases
            .try_acquire(thread_id)
            .ok_or_else(|| RequestError::ThreadBusy(thread_id.to_string()))?;

        if self
            .storage
            .get_state(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .is_none()
        {
            return Err(RequestError::ThreadNotFound(thread_id.to_string()));
        }

        let checkpoint = self
            .storage
            .take_checkpoint(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .ok_or_else(|| RequestError::NoCheckpoint(thread_id.to_string()))?;
        let history = self.checkpointed_history(&checkpoint).await?;
        let context = self.context(thread_id);

        let first = transition(
            &checkpoint.state(),
            &context,
            Event::Cancel {
                reason: reason.to_string(),
            },
        )
        .map_err(|e| RequestError::rejected(thread_id, e))?;

        tracing::info!(
            thread_id = %thread_id,
            tool_call_id = %checkpoint.pending.id,
            reason = %reason,
            "Cancelling pending approval"
        );
        Ok(self.spawn_session(lease, context, &history, first))
    }

    pub async fn snapshot(&self, thread_id: &str) -> Result<ThreadSnapshot, RequestError> {
        let state = self
            .storage
            .get_state(thread_id)
            .await
            .map_err(RequestError::Storage)?
            .ok_or_else(|| RequestError::ThreadNotFound(thread_id.to_string()))?;
        let history = self.history(thread_id).await?;
        let checkpoint = self
            .storage
            .get_checkpoint(thread_id)
            .await
            .map_err(RequestError::Storage)?;

        Ok(ThreadSnapshot {
            thread_id: thread_id.to_string(),
            status: state.status(),
            history,
            checkpoint,
        })
    }

    /// Cancel approvals that have waited longer than `max_age`.
    /// Returns how many were cancelled.
    pub async fn expire_stale_approvals(&self, max_age: Duration) -> Result<usize, RequestError> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(0);
        };
        let stale = self
            .storage
            .checkpoints_older_than(Utc::now() - max_age)
            .await
            .map_err(RequestError::Storage)?;

        let mut expired = 0;
        for checkpoint in stale {
            let thread_id = checkpoint.thread_id;
            if self.leases.is_held(&thread_id) {
                continue;
            }
            match self.cancel(&thread_id, CANCELLED).await {
                Ok(session) => {
                    session.finish().await?;
                    expired += 1;
                    tracing::info!(thread_id = %thread_id, "Expired pending approval");
                }
                Err(RequestError::ThreadBusy(_) | RequestError::NoCheckpoint(_)) => {}
                Err(e) => {
                    tracing::warn!(thread_id = %thread_id, error = %e, "Failed to expire approval");
                }
            }
        }
        Ok(expired)
    }

    /// Periodically expire stale approvals until shutdown
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, max_age: Duration, every: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = orchestrator.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.expire_stale_approvals(max_age).await {
                            tracing::warn!(error = %e, "Approval expiry sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Approval expiry sweeper stopped");
        })
    }

    /// Stop background work and signal running tools
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn context(&self, thread_id: &str) -> ConvContext {
        ConvContext::new(thread_id, self.tools.gated_tools())
            .with_retry_policy(self.config.max_llm_attempts, self.config.retry_base_delay)
    }

    async fn history(&self, thread_id: &str) -> Result<MessageHistory, RequestError> {
        self.storage
            .get_history(thread_id)
            .await
            .map_err(RequestError::Storage)
    }

    /// Load the history and check it is exactly the one the checkpoint pinned
    async fn checkpointed_history(&self, checkpoint: &Checkpoint) -> Result<MessageHistory, RequestError> {
        let history = self.history(&checkpoint.thread_id).await?;
        let pending_present = history.unresolved_calls().iter().any(|c| c.id == checkpoint.pending.id);

        if history.len() == checkpoint.history_len && pending_present {
            return Ok(history);
        }

        let reason = format!(
            "checkpoint expects {} messages with {} unresolved, found {}",
            checkpoint.history_len,
            checkpoint.pending.id,
            history.len()
        );
        tracing::error!(thread_id = %checkpoint.thread_id, reason = %reason, "Checkpoint does not match history");
        self.storage
            .update_state(
                &checkpoint.thread_id,
                &ConvState::Terminated {
                    reason: reason.clone(),
                },
            )
            .await
            .map_err(RequestError::Storage)?;
        // Already gone when cancel consumed it first
        self.storage
            .take_checkpoint(&checkpoint.thread_id)
            .await
            .map_err(RequestError::Storage)?;
        Err(RequestError::HistoryInvariantViolation(reason))
    }

    fn spawn_session(
        &self,
        lease: ThreadLease,
        context: ConvContext,
        history: &MessageHistory,
        first: TransitionResult,
    ) -> SessionHandle {
        let thread_id = context.thread_id.clone();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let runtime = ConversationRuntime::new(
            context,
            self.storage.clone(),
            TurnExecutor::new(self.model.clone(), &self.tools),
            self.tools.clone(),
            EventTranslator::new(&thread_id, history, self.config.replay_mode),
            events_tx,
            self.shutdown.child_token(),
        );

        let task = tokio::spawn(async move {
            let state = runtime.run(first).await;
            drop(lease);
            state
        });

        SessionHandle {
            thread_id,
            events: events_rx,
            task,
        }
    }
}
