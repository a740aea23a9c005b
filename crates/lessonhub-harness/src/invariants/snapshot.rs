//! Observable session state for invariant checking.
//!
//! A snapshot is taken at one instant from the session's read-only accessors
//! and its rendered view, so checks see exactly what a user would.

use lessonhub_chat::{ChannelState, ChatSession, ChatSummary, MessageRow, SessionPhase};
use lessonhub_core::{ChatId, Environment, TypingUser, UserId};

/// Snapshot of one chat session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Signed-in user.
    pub self_id: UserId,
    /// Selected chat.
    pub selected: Option<ChatId>,
    /// Session phase.
    pub phase: SessionPhase,
    /// Channel state of the selected chat.
    pub connection: ChannelState,
    /// Chats with a message cache entry.
    pub cached_chats: Vec<ChatId>,
    /// Rendered messages in display order.
    pub messages: Vec<MessageRow>,
    /// Rendered typing indicator.
    pub typing: Vec<TypingUser>,
    /// Rendered chat list.
    pub chats: Vec<ChatSummary>,
}

impl SessionSnapshot {
    /// Snapshot with nothing selected and nothing cached.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture a session's observable state at `now`.
    pub fn from_session<E: Environment>(session: &ChatSession<E>, now: E::Instant) -> Self {
        let view = session.view(now);
        let mut cached_chats: Vec<ChatId> = session.cache().cached_chats().collect();
        cached_chats.sort_unstable();

        Self {
            self_id: session.auth().user_id,
            selected: view.selected,
            phase: view.phase,
            connection: view.connection,
            cached_chats,
            messages: view.messages,
            typing: view.typing,
            chats: view.chats,
        }
    }
}
