//! Property-based tests for the state machine
//!
//! A small in-memory driver executes effects the way the runtime does, so
//! whole turns can be explored without I/O.

use super::state::*;
use super::transition::*;
use super::*;
use crate::history::{AiResponse, Message, MessageHistory, ToolCall, ToolResult};
use crate::llm::LlmErrorKind;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new("test-thread", HashSet::from(["moveMoney".to_string()]))
        .with_retry_policy(3, Duration::from_millis(1))
}

fn call(id: String, gated: bool) -> ToolCall {
    if gated {
        ToolCall::new(id, "moveMoney", json!({"amount": 1, "recipient": "Bob"}))
    } else {
        ToolCall::new(id, "maths", json!({"input": 1}))
    }
}

#[derive(Debug, Clone, Copy)]
enum Human {
    Approve,
    Deny,
    Cancel,
}

/// Executes effects against an in-memory history
struct Driver {
    state: ConvState,
    history: MessageHistory,
    responses: VecDeque<AiResponse>,
    humans: VecDeque<Human>,
    checkpoint: Option<(ToolCall, Vec<ToolCall>)>,
    model_calls: usize,
}

impl Driver {
    fn new(responses: Vec<AiResponse>, humans: Vec<Human>) -> Self {
        Self {
            state: ConvState::Idle,
            history: MessageHistory::new(),
            responses: responses.into(),
            humans: humans.into(),
            checkpoint: None,
            model_calls: 0,
        }
    }

    /// Feed one event and everything it generates; returns once quiescent
    fn run(&mut self, ctx: &ConvContext, event: Event) -> Result<(), TransitionError> {
        let mut queue = vec![event];
        while let Some(event) = queue.pop() {
            let result = transition(&self.state, ctx, event)?;
            self.state = result.new_state;
            for effect in result.effects {
                if let Some(next) = self.execute(effect) {
                    queue.push(next);
                }
            }
        }
        Ok(())
    }

    fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::PersistMessage { message } => {
                self.history.append(message);
                None
            }
            Effect::PersistToolResults { results } => {
                for r in results {
                    self.history.append(Message::ToolResult(r));
                }
                None
            }
            Effect::RequestLlm => {
                assert!(
                    self.history.ensure_ready_for_model().is_ok(),
                    "model saw unpaired history: {:?}",
                    self.history
                );
                self.model_calls += 1;
                let response = self
                    .responses
                    .pop_front()
                    .unwrap_or_else(|| AiResponse::text("done"));
                Some(Event::LlmResponse { response })
            }
            Effect::DispatchTools { calls } => Some(Event::ToolsCompleted {
                results: calls.iter().map(|c| ToolResult::success(c, "ok")).collect(),
            }),
            Effect::DenyTools { calls, reason } => Some(Event::ToolsCompleted {
                results: calls
                    .iter()
                    .map(|c| ToolResult::denied(c, format!("denied: {reason:?}")))
                    .collect(),
            }),
            Effect::SaveCheckpoint { pending, remaining } => {
                assert!(self.checkpoint.is_none(), "second live checkpoint");
                self.checkpoint = Some((pending, remaining));
                None
            }
            Effect::ScheduleRetry { attempt, .. } => Some(Event::RetryTimeout { attempt }),
            Effect::PersistState | Effect::Notify(_) => None,
        }
    }

    /// Run a full conversation turn, answering every suspension
    fn drive_turn(&mut self, ctx: &ConvContext, text: &str) {
        self.run(
            ctx,
            Event::UserMessage {
                messages: vec![Message::human(text)],
            },
        )
        .unwrap();

        while let ConvState::AwaitingApproval { pending, .. } = self.state.clone() {
            // Resuming consumes the checkpoint
            assert!(self.checkpoint.take().is_some());
            let event = match self.humans.pop_front().unwrap_or(Human::Approve) {
                Human::Approve => Event::ApprovalDecision {
                    decision: ApprovalDecision::approve(pending.id),
                },
                Human::Deny => Event::ApprovalDecision {
                    decision: ApprovalDecision::deny(pending.id, Some("no".to_string())),
                },
                Human::Cancel => Event::Cancel {
                    reason: "cancelled".to_string(),
                },
            };
            self.run(ctx, event).unwrap();
        }
    }
}

/// Within each AI message, results appear in the order the calls were made
fn results_follow_call_order(history: &MessageHistory) -> bool {
    let messages = history.messages();
    messages.iter().enumerate().all(|(i, m)| match m {
        Message::Ai(ai) => {
            let ids: Vec<&str> = ai.tool_calls.iter().map(|c| c.id.as_str()).collect();
            let answered: Vec<&str> = messages[i + 1..]
                .iter()
                .filter_map(|m| match m {
                    Message::ToolResult(r) if ids.contains(&r.tool_call_id.as_str()) => {
                        Some(r.tool_call_id.as_str())
                    }
                    _ => None,
                })
                .collect();
            answered == ids
        }
        _ => true,
    })
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

/// Model responses as gating flags; ids are assigned uniquely
fn arb_responses() -> impl Strategy<Value = Vec<AiResponse>> {
    proptest::collection::vec(proptest::collection::vec(any::<bool>(), 1..5), 0..5).prop_map(
        |batches| {
            batches
                .into_iter()
                .enumerate()
                .map(|(b, flags)| {
                    let calls = flags
                        .into_iter()
                        .enumerate()
                        .map(|(c, gated)| call(format!("call-{b}-{c}"), gated))
                        .collect();
                    AiResponse::with_tool_calls("", calls)
                })
                .collect()
        },
    )
}

fn arb_human() -> impl Strategy<Value = Human> {
    prop_oneof![Just(Human::Approve), Just(Human::Deny), Just(Human::Cancel)]
}

fn arb_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        Just(ConvState::Idle),
        (1u32..4).prop_map(|attempt| ConvState::LlmRequesting { attempt }),
        Just(ConvState::ToolDispatching {
            batch: vec![call("a".to_string(), false)],
            remaining: vec![],
        }),
        Just(ConvState::AwaitingApproval {
            pending: call("p".to_string(), true),
            remaining: vec![call("r".to_string(), false)],
        }),
        Just(ConvState::Cancelling {
            batch: vec![call("p".to_string(), true)],
        }),
        "[a-z]{1,10}".prop_map(|message| ConvState::Error {
            message,
            error_kind: LlmErrorKind::Unknown,
        }),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        "[a-z ]{1,10}".prop_map(|t| Event::UserMessage {
            messages: vec![Message::human(t)]
        }),
        arb_responses().prop_map(|mut r| Event::LlmResponse {
            response: r.pop().unwrap_or_else(|| AiResponse::text("hi")),
        }),
        (1u32..4).prop_map(|attempt| Event::RetryTimeout { attempt }),
        (1u32..4).prop_map(|attempt| Event::LlmError {
            message: "boom".to_string(),
            error_kind: LlmErrorKind::Network,
            attempt,
        }),
        any::<bool>().prop_map(|approved| Event::ApprovalDecision {
            decision: ApprovalDecision {
                tool_call_id: "p".to_string(),
                approved,
                reason: None,
            },
        }),
        Just(Event::Cancel {
            reason: "cancelled".to_string()
        }),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every history the machine builds is fully paired once the turn ends,
    /// and the model never sees an unpaired history.
    #[test]
    fn prop_pairing_invariant_holds(
        responses in arb_responses(),
        humans in proptest::collection::vec(arb_human(), 0..10),
    ) {
        let ctx = test_context();
        let mut driver = Driver::new(responses, humans);
        driver.drive_turn(&ctx, "go");

        prop_assert_eq!(&driver.state, &ConvState::Idle);
        prop_assert!(driver.history.ensure_ready_for_model().is_ok());
        prop_assert!(driver.checkpoint.is_none());
        prop_assert!(results_follow_call_order(&driver.history));
    }

    /// Gated calls never run without a decision
    #[test]
    fn prop_gated_calls_suspend_before_dispatch(flags in proptest::collection::vec(any::<bool>(), 1..6)) {
        let ctx = test_context();
        let calls: Vec<ToolCall> = flags
            .iter()
            .enumerate()
            .map(|(i, g)| call(format!("c{i}"), *g))
            .collect();
        let result = transition(
            &ConvState::LlmRequesting { attempt: 1 },
            &ctx,
            Event::LlmResponse { response: AiResponse::with_tool_calls("", calls) },
        ).unwrap();

        for effect in &result.effects {
            if let Effect::DispatchTools { calls } = effect {
                prop_assert!(calls.iter().all(|c| !ctx.is_gated(&c.name)));
            }
        }
        if flags[0] {
            let is_awaiting = matches!(result.new_state, ConvState::AwaitingApproval { .. });
            prop_assert!(is_awaiting);
        }
    }

    /// A decision naming any call other than the pending one is rejected
    #[test]
    fn prop_mismatched_decision_rejected(id in "[a-z]{1,8}", approved in any::<bool>()) {
        prop_assume!(id != "p");
        let state = ConvState::AwaitingApproval {
            pending: call("p".to_string(), true),
            remaining: vec![],
        };
        let result = transition(
            &state,
            &test_context(),
            Event::ApprovalDecision {
                decision: ApprovalDecision { tool_call_id: id, approved, reason: None },
            },
        );
        let is_mismatch = matches!(result, Err(TransitionError::DecisionMismatch { .. }));
        prop_assert!(is_mismatch);
    }

    /// Running states reject new user input
    #[test]
    fn prop_busy_rejects_messages(state in arb_state(), text in "[a-z]{1,10}") {
        let result = transition(
            &state,
            &test_context(),
            Event::UserMessage { messages: vec![Message::human(text)] },
        );
        match state.status() {
            ExecutionStatus::Idle => prop_assert!(result.is_ok()),
            _ => prop_assert!(result.is_err()),
        }
    }

    /// Terminated absorbs every event
    #[test]
    fn prop_terminated_absorbs(event in arb_event()) {
        let state = ConvState::Terminated { reason: "bad history".to_string() };
        let result = transition(&state, &test_context(), event);
        let is_terminated = matches!(result, Err(TransitionError::Terminated(_)));
        prop_assert!(is_terminated);
    }

    /// Any state change is persisted
    #[test]
    fn prop_state_changes_persist(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, &test_context(), event) {
            if result.new_state != state {
                prop_assert!(result.effects.contains(&Effect::PersistState));
            }
        }
    }

    /// Model faults never append to the history
    #[test]
    fn prop_model_fault_appends_nothing(attempt in 1u32..4, retryable in any::<bool>()) {
        let kind = if retryable { LlmErrorKind::ServerError } else { LlmErrorKind::Auth };
        let result = transition(
            &ConvState::LlmRequesting { attempt },
            &test_context(),
            Event::LlmError { message: "x".to_string(), error_kind: kind, attempt },
        ).unwrap();
        let appends = result.effects.iter().any(|e| matches!(
            e,
            Effect::PersistMessage { .. } | Effect::PersistToolResults { .. }
        ));
        prop_assert!(!appends);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_transfer_approval_cycle() {
    let ctx = test_context();
    let transfer = call("t1".to_string(), true);
    let mut driver = Driver::new(
        vec![
            AiResponse::with_tool_calls("", vec![transfer.clone()]),
            AiResponse::text("Sent $500 to Bob."),
        ],
        vec![],
    );

    driver
        .run(
            &ctx,
            Event::UserMessage {
                messages: vec![Message::human("transfer $500 to Bob")],
            },
        )
        .unwrap();
    assert_eq!(
        driver.state.status(),
        ExecutionStatus::AwaitingApproval {
            pending: transfer.clone()
        }
    );
    assert_eq!(driver.model_calls, 1);

    let (pending, remaining) = driver.checkpoint.take().unwrap();
    let checkpoint = Checkpoint {
        thread_id: "test-thread".to_string(),
        history_len: driver.history.len(),
        pending,
        remaining,
        created_at: chrono::Utc::now(),
    };
    let result = resume(&checkpoint, &ctx, ApprovalDecision::approve("t1")).unwrap();
    assert!(result.effects.contains(&Effect::DispatchTools {
        calls: vec![transfer]
    }));

    driver
        .run(
            &ctx,
            Event::ApprovalDecision {
                decision: ApprovalDecision::approve("t1"),
            },
        )
        .unwrap();
    assert_eq!(driver.state, ConvState::Idle);
    assert_eq!(driver.model_calls, 2);
    assert_eq!(
        driver.history.last_message(),
        Some(&Message::Ai(AiResponse::text("Sent $500 to Bob.")))
    );
}

#[test]
fn test_mixed_batch_sequential_gating() {
    let ctx = test_context();
    let calls = vec![
        call("a".to_string(), false),
        call("b".to_string(), true),
        call("c".to_string(), true),
        call("d".to_string(), false),
    ];
    let mut driver = Driver::new(
        vec![AiResponse::with_tool_calls("", calls)],
        vec![Human::Deny, Human::Approve],
    );
    driver.drive_turn(&ctx, "go");

    let results: Vec<_> = driver
        .history
        .tool_results()
        .map(|r| (r.tool_call_id.as_str(), r.outcome))
        .collect();
    use crate::history::ToolOutcome::{Denied, Success};
    assert_eq!(
        results,
        vec![("a", Success), ("b", Denied), ("c", Success), ("d", Success)]
    );
}
