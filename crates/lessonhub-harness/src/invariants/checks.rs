//! Standard session invariants.

use std::collections::HashSet;

use lessonhub_chat::{MessageKey, SessionPhase};

use super::{Invariant, InvariantResult, SessionSnapshot, Violation};

/// A server message ID appears at most once in the rendered list.
///
/// REST responses and push deliveries of the same message must collapse into
/// a single row.
pub struct UniqueMessageIds;

impl Invariant for UniqueMessageIds {
    fn name(&self) -> &'static str {
        "unique_message_ids"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        for row in &state.messages {
            if let MessageKey::Confirmed(id) = row.key
                && !seen.insert(id)
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("message {id} rendered twice in chat {:?}", state.selected),
                });
            }
        }
        Ok(())
    }
}

/// Rendered messages are ordered by creation time, ties broken by key.
pub struct OrderedMessages;

impl Invariant for OrderedMessages {
    fn name(&self) -> &'static str {
        "ordered_messages"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        for pair in state.messages.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if (a.created_at, a.key) > (b.created_at, b.key) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{:?} at {} rendered before {:?} at {}",
                        a.key, a.created_at, b.key, b.created_at
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Only the selected chat may have cached messages.
///
/// A switch purges the previous chat, so late deliveries can never leak into
/// another chat's view.
pub struct CacheScopedToSelection;

impl Invariant for CacheScopedToSelection {
    fn name(&self) -> &'static str {
        "cache_scoped_to_selection"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        match state.cached_chats.iter().find(|&&id| Some(id) != state.selected) {
            Some(stray) => Err(Violation {
                invariant: self.name(),
                message: format!(
                    "chat {stray} still cached while {:?} is selected",
                    state.selected
                ),
            }),
            None => Ok(()),
        }
    }
}

/// The local user never shows up in the typing indicator.
pub struct TypingExcludesSelf;

impl Invariant for TypingExcludesSelf {
    fn name(&self) -> &'static str {
        "typing_excludes_self"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        if state.typing.iter().any(|u| u.user_id == state.self_id) {
            return Err(Violation {
                invariant: self.name(),
                message: format!("user {} sees themselves typing", state.self_id),
            });
        }
        Ok(())
    }
}

/// The phase agrees with the selection.
///
/// Idle exactly when nothing is selected, and an idle session renders no
/// messages and no typing users.
pub struct PhaseMatchesSelection;

impl Invariant for PhaseMatchesSelection {
    fn name(&self) -> &'static str {
        "phase_matches_selection"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        let idle = state.phase == SessionPhase::Idle;
        if idle != state.selected.is_none() {
            return Err(Violation {
                invariant: self.name(),
                message: format!("phase {:?} with selection {:?}", state.phase, state.selected),
            });
        }
        if idle && !(state.messages.is_empty() && state.typing.is_empty()) {
            return Err(Violation {
                invariant: self.name(),
                message: format!(
                    "idle session renders {} messages and {} typing users",
                    state.messages.len(),
                    state.typing.len()
                ),
            });
        }
        Ok(())
    }
}

/// At most one chat-list row is highlighted, and only the selected chat.
pub struct SelectionHighlighted;

impl Invariant for SelectionHighlighted {
    fn name(&self) -> &'static str {
        "selection_highlighted"
    }

    fn check(&self, state: &SessionSnapshot) -> InvariantResult {
        let highlighted: Vec<_> =
            state.chats.iter().filter(|c| c.selected).map(|c| c.chat_id).collect();
        let ok = match highlighted.as_slice() {
            [] => true,
            [only] => Some(*only) == state.selected,
            _ => false,
        };
        if !ok {
            return Err(Violation {
                invariant: self.name(),
                message: format!("rows {highlighted:?} highlighted, {:?} selected", state.selected),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lessonhub_chat::{MessageRow, RowStatus};
    use lessonhub_core::{Sender, TypingUser};

    use super::*;

    fn row(key: MessageKey, created_at: u64) -> MessageRow {
        MessageRow {
            key,
            sender: Sender { user_id: 2, display_name: "Bo".into() },
            content: "hi".into(),
            attachment: None,
            created_at,
            edited: false,
            own: false,
            status: RowStatus::Confirmed,
        }
    }

    fn active(chat_id: u64) -> SessionSnapshot {
        SessionSnapshot {
            self_id: 1,
            selected: Some(chat_id),
            phase: SessionPhase::Active,
            cached_chats: vec![chat_id],
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn duplicate_rows_are_flagged() {
        let mut state = active(7);
        state.messages = vec![row(MessageKey::Confirmed(1), 10), row(MessageKey::Confirmed(1), 10)];
        assert!(UniqueMessageIds.check(&state).is_err());

        state.messages.pop();
        assert!(UniqueMessageIds.check(&state).is_ok());
    }

    #[test]
    fn out_of_order_rows_are_flagged() {
        let mut state = active(7);
        state.messages = vec![row(MessageKey::Confirmed(2), 20), row(MessageKey::Confirmed(1), 10)];
        assert!(OrderedMessages.check(&state).is_err());

        state.messages.reverse();
        assert!(OrderedMessages.check(&state).is_ok());
    }

    #[test]
    fn same_timestamp_orders_confirmed_before_pending() {
        let mut state = active(7);
        state.messages = vec![row(MessageKey::Confirmed(9), 10), row(MessageKey::Pending(1), 10)];
        assert!(OrderedMessages.check(&state).is_ok());
    }

    #[test]
    fn stray_cache_entry_is_flagged() {
        let mut state = active(7);
        state.cached_chats = vec![3, 7];
        let violation = CacheScopedToSelection.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "cache_scoped_to_selection");
    }

    #[test]
    fn self_typing_is_flagged() {
        let mut state = active(7);
        state.typing = vec![TypingUser { user_id: 1, display_name: "Me".into() }];
        assert!(TypingExcludesSelf.check(&state).is_err());
    }

    #[test]
    fn idle_with_selection_is_flagged() {
        let mut state = active(7);
        state.phase = SessionPhase::Idle;
        assert!(PhaseMatchesSelection.check(&state).is_err());
        assert!(PhaseMatchesSelection.check(&SessionSnapshot::empty()).is_ok());
    }
}
