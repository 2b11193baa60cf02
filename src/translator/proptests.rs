//! Property-based tests for event translation

use super::*;
use crate::history::{AiResponse, Message, MessageHistory, ToolCall, ToolResult};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn maths(id: String) -> ToolCall {
    ToolCall::new(id, "maths", json!({"input": 1}))
}

/// History with `n` calls answered in earlier sessions
fn prior_history(n: usize) -> MessageHistory {
    let mut history = MessageHistory::new();
    history.append(Message::human("earlier"));
    for i in 0..n {
        let call = maths(format!("old-{i}"));
        history.append(Message::Ai(AiResponse::with_tool_calls("", vec![call.clone()])));
        history.append(Message::ToolResult(ToolResult::success(&call, "2")));
    }
    history
}

fn arb_mode() -> impl Strategy<Value = ReplayMode> {
    prop_oneof![Just(ReplayMode::Omit), Just(ReplayMode::Paired)]
}

fn is_input_for(event: &ExternalEvent, ids: &HashSet<String>) -> bool {
    matches!(
        event,
        ExternalEvent::ToolInputStart { tool_call_id, .. }
            | ExternalEvent::ToolInputAvailable { tool_call_id, .. }
            if ids.contains(tool_call_id)
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Resolved calls from earlier sessions never get input events
    #[test]
    fn prop_no_reemission_of_resolved_calls(
        prior in 0usize..8,
        batches in prop::collection::vec(1usize..4, 0..4),
        repeat_old in any::<bool>(),
        mode in arb_mode(),
    ) {
        let history = prior_history(prior);
        let mut translator = EventTranslator::new("thread", &history, mode);
        let mut events = translator.begin();
        let mut next = 0;

        for size in batches {
            let mut calls: Vec<ToolCall> = (0..size)
                .map(|_| {
                    next += 1;
                    maths(format!("new-{next}"))
                })
                .collect();
            if repeat_old && prior > 0 {
                calls.push(maths("old-0".to_string()));
            }

            events.extend(translator.translate(&Notification::ModelResponded {
                response: AiResponse::with_tool_calls("", calls.clone()),
            }));
            for call in calls.iter().rev() {
                events.extend(translator.translate(&Notification::ToolResolved {
                    result: ToolResult::success(call, "ok"),
                }));
            }
        }
        events.extend(translator.translate(&Notification::ModelResponded {
            response: AiResponse::text("done"),
        }));
        events.extend(translator.translate(&Notification::TurnFinished));

        prop_assert!(verify_stream(&events).is_ok());
        let old_ids: HashSet<String> = (0..prior).map(|i| format!("old-{i}")).collect();
        prop_assert_eq!(events.iter().filter(|e| is_input_for(e, &old_ids)).count(), 0);
        prop_assert_eq!(events.last(), Some(&ExternalEvent::TurnEnd));
    }

    /// A session cut short at any point still closes every input it opened
    #[test]
    fn prop_abort_keeps_stream_paired(size in 1usize..6, resolved in 0usize..6) {
        let calls: Vec<ToolCall> = (0..size).map(|i| maths(format!("c{i}"))).collect();
        let mut translator = EventTranslator::new("thread", &MessageHistory::new(), ReplayMode::Omit);
        let mut events = translator.begin();
        events.extend(translator.translate(&Notification::ModelResponded {
            response: AiResponse::with_tool_calls("", calls.clone()),
        }));
        for call in calls.iter().take(resolved) {
            events.extend(translator.translate(&Notification::ToolResolved {
                result: ToolResult::success(call, "ok"),
            }));
        }
        events.extend(translator.abort("model unavailable"));

        prop_assert!(verify_stream(&events).is_ok());
        let outputs = events
            .iter()
            .filter(|e| matches!(e, ExternalEvent::ToolOutputAvailable { .. } | ExternalEvent::ToolDenied { .. }))
            .count();
        prop_assert_eq!(outputs, size);
    }
}
