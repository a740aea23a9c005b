//! Read-only view snapshot.
//!
//! Everything a renderer needs, detached from the session's internal state.
//! Snapshots compare by value so a runtime can skip publishing unchanged
//! frames.

use lessonhub_core::{Attachment, ChatId, Sender, TypingUser};

use crate::{chat_list::ChatSummary, connection::ChannelState, reconciler::MessageKey};

/// Lifecycle phase of the chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No chat selected.
    #[default]
    Idle,
    /// Chat selected, channel or minimum display time pending.
    Switching,
    /// Chat selected and settled.
    Active,
    /// Selection failed; waiting for retry or re-authentication.
    Error,
}

/// Category of the user-facing error banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerKind {
    /// Credentials missing or rejected. Cleared by re-authenticating.
    Auth,
    /// Push channel reported a server-side error.
    Connectivity,
    /// History page could not be loaded.
    History,
    /// Chat list could not be loaded.
    ChatList,
    /// Edit or delete failed.
    Update,
}

/// Dismissible error banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBanner {
    /// Category.
    pub kind: BannerKind,
    /// User-facing description.
    pub message: String,
    /// Whether the banner offers a retry button.
    pub retryable: bool,
}

/// Delivery status of a rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    /// Server-confirmed.
    Confirmed,
    /// Optimistic, send in flight.
    Sending,
    /// Optimistic, send failed.
    Failed {
        /// Failure description
        reason: String,
    },
}

/// One rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    /// Confirmed or local key.
    pub key: MessageKey,
    /// Author.
    pub sender: Sender,
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Creation timestamp (ms).
    pub created_at: u64,
    /// Whether the content was edited.
    pub edited: bool,
    /// Whether the local user wrote it.
    pub own: bool,
    /// Delivery status.
    pub status: RowStatus,
}

/// Snapshot of the session for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatView {
    /// Session phase.
    pub phase: SessionPhase,
    /// Selected chat.
    pub selected: Option<ChatId>,
    /// Title of the selected chat.
    pub title: Option<String>,
    /// Channel state of the selected chat.
    pub connection: ChannelState,
    /// Messages in display order.
    pub messages: Vec<MessageRow>,
    /// Remote users typing in the selected chat.
    pub typing: Vec<TypingUser>,
    /// Error banner.
    pub banner: Option<ErrorBanner>,
    /// Chat list rows.
    pub chats: Vec<ChatSummary>,
    /// Whether a history page is loading.
    pub history_loading: bool,
    /// Whether the oldest message has been loaded.
    pub history_exhausted: bool,
}

impl ChatView {
    /// Whether the switching placeholder should be shown.
    pub fn is_switching(&self) -> bool {
        self.phase == SessionPhase::Switching
    }

    /// Whether the selected chat's channel is live.
    pub fn is_connected(&self) -> bool {
        self.connection == ChannelState::Connected
    }
}
