//! Property-based tests for the chat session.
//!
//! Random interleavings of user intents, channel events, collaborator results
//! and time. [`SessionHarness`] asserts every standard invariant after each
//! step, so a violation fails the case with the offending step in the panic.

use std::time::Duration;

use lessonhub_chat::{SessionAction, SessionPhase};
use lessonhub_core::{ApiError, PushEvent};
use lessonhub_harness::{SessionHarness, SimEnv, message, signed_in, typing_user};
use proptest::prelude::*;

const ME: u64 = 1;

#[derive(Debug, Clone)]
enum Op {
    Select(u64),
    Clear,
    Open,
    Drop,
    Push { id: u64, sender: u64, at: u64 },
    Typing(u64),
    TypingStop(u64),
    History(Vec<u64>),
    HistoryFails,
    Send(String),
    CompleteSend { ok: bool, id: u64 },
    LocalTyping,
    LoadOlder,
    Retry,
    Advance(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..4).prop_map(Op::Select),
        1 => Just(Op::Clear),
        3 => Just(Op::Open),
        1 => Just(Op::Drop),
        4 => (1u64..30, 1u64..4, 0u64..50).prop_map(|(id, sender, at)| Op::Push { id, sender, at }),
        2 => (1u64..4).prop_map(Op::Typing),
        1 => (1u64..4).prop_map(Op::TypingStop),
        2 => prop::collection::vec(1u64..30, 0..8).prop_map(Op::History),
        1 => Just(Op::HistoryFails),
        2 => "[a-z ]{0,12}".prop_map(Op::Send),
        2 => (any::<bool>(), 100u64..200).prop_map(|(ok, id)| Op::CompleteSend { ok, id }),
        1 => Just(Op::LocalTyping),
        1 => Just(Op::LoadOlder),
        1 => Just(Op::Retry),
        3 => (0u64..4_000).prop_map(Op::Advance),
    ]
}

fn pending_send(actions: &[SessionAction]) -> Option<(u64, u64, String)> {
    actions.iter().rev().find_map(|a| match a {
        SessionAction::SendMessage { request_id, chat_id, draft } => {
            Some((*request_id, *chat_id, draft.content.clone()))
        },
        _ => None,
    })
}

fn run(h: &mut SessionHarness, op: Op, sends: &mut Vec<(u64, u64, String)>) {
    let selected = h.session().selected();
    match op {
        Op::Select(chat_id) => {
            h.select(chat_id);
        },
        Op::Clear => {
            h.clear_selection();
        },
        Op::Open => {
            if let Some(chat_id) = selected {
                h.open(chat_id);
            }
        },
        Op::Drop => {
            if let Some(chat_id) = selected {
                h.drop_channel(chat_id);
            }
        },
        Op::Push { id, sender, at } => {
            if let Some(chat_id) = selected {
                h.push(chat_id, PushEvent::Message(message(chat_id, id, sender, "push", at)));
            }
        },
        Op::Typing(user) => {
            if let Some(chat_id) = selected {
                h.push(chat_id, PushEvent::Typing(typing_user(user)));
            }
        },
        Op::TypingStop(user) => {
            if let Some(chat_id) = selected {
                h.push(chat_id, PushEvent::TypingStop(typing_user(user)));
            }
        },
        Op::History(ids) => {
            if let Some(chat_id) = selected {
                let page = ids.into_iter().map(|id| message(chat_id, id, 2, "old", id)).collect();
                h.complete_history(chat_id, Ok(page));
            }
        },
        Op::HistoryFails => {
            if let Some(chat_id) = selected {
                let error = ApiError::Timeout { elapsed: Duration::from_secs(10) };
                h.complete_history(chat_id, Err(error));
            }
        },
        Op::Send(text) => {
            if let Ok(actions) = h.send(&text)
                && let Some(send) = pending_send(&actions)
            {
                sends.push(send);
            }
        },
        Op::CompleteSend { ok, id } => {
            if let Some((request_id, chat_id, content)) = sends.pop() {
                let result = if ok {
                    Ok(message(chat_id, id, ME, &content, 60))
                } else {
                    Err(ApiError::Network("reset".into()))
                };
                h.complete_send(request_id, result);
            }
        },
        Op::LocalTyping => {
            h.type_key();
        },
        Op::LoadOlder => {
            h.load_older();
        },
        Op::Retry => {
            h.retry();
        },
        Op::Advance(ms) => {
            h.advance(Duration::from_millis(ms));
        },
    }
}

proptest! {
    /// Session invariants hold under arbitrary operation sequences.
    #[test]
    fn prop_session_invariants_hold(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 0..80),
    ) {
        let mut h = SessionHarness::with_env(SimEnv::with_seed(seed), signed_in(ME, "Ann"));
        let mut sends = Vec::new();
        for op in ops {
            run(&mut h, op, &mut sends);
        }
    }

    /// A selected chat with a live channel always settles to active.
    #[test]
    fn prop_open_channel_settles(
        ops in prop::collection::vec(op_strategy(), 0..40),
        target in 1u64..4,
    ) {
        let mut h = SessionHarness::new(signed_in(ME, "Ann"));
        let mut sends = Vec::new();
        for op in ops {
            run(&mut h, op, &mut sends);
        }

        h.clear_selection();
        h.select(target);
        h.open(target);
        h.advance(Duration::from_millis(300));
        prop_assert_eq!(h.view().phase, SessionPhase::Active);
        prop_assert_eq!(h.view().selected, Some(target));
    }

    /// After a switch, nothing from the previous chat is rendered.
    #[test]
    fn prop_switch_leaves_no_trace(
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let mut h = SessionHarness::new(signed_in(ME, "Ann"));
        let mut sends = Vec::new();
        h.select(1);
        for op in ops {
            run(&mut h, op, &mut sends);
        }

        let previous = h.session().selected();
        let next = previous.map_or(1, |id| id % 3 + 1);
        h.select(next);
        let view = h.view();
        prop_assert!(view.messages.is_empty());
        prop_assert!(view.typing.is_empty());
        if let Some(previous) = previous {
            prop_assert!(!h.session().cache().has_chat(previous));
        }
    }
}
