//! Chat directory.
//!
//! View model for the chat list: titles, unread counters and last-message
//! previews. Replaced wholesale whenever a refreshed list arrives and patched
//! locally between refreshes so the list reacts without a round trip.

use lessonhub_core::{Chat, ChatId, Message, UserId};

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    /// Chat ID.
    pub chat_id: ChatId,
    /// Derived title.
    pub title: String,
    /// Subject tag.
    pub subject: Option<String>,
    /// Unread messages.
    pub unread_count: u32,
    /// Text of the latest message.
    pub last_message: Option<String>,
    /// Timestamp of the latest message (ms).
    pub last_activity: Option<u64>,
    /// Whether this chat is selected.
    pub selected: bool,
}

/// Known chats of the signed-in user.
#[derive(Debug, Clone, Default)]
pub struct ChatDirectory {
    chats: Vec<Chat>,
    loaded: bool,
}

impl ChatDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a fresh server copy.
    ///
    /// The active chat is being read, so its unread counter is forced to zero
    /// even if the server has not processed the mark-read yet.
    pub fn replace(&mut self, chats: Vec<Chat>, active: Option<ChatId>) {
        self.chats = chats;
        self.loaded = true;
        if let Some(chat_id) = active {
            self.mark_read(chat_id);
        }
    }

    /// Whether a list has been loaded at least once.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Zero a chat's unread counter. Returns `false` if the chat is unknown.
    pub fn mark_read(&mut self, chat_id: ChatId) -> bool {
        match self.chats.iter_mut().find(|c| c.id == chat_id) {
            Some(chat) => {
                chat.unread_count = 0;
                true
            },
            None => false,
        }
    }

    /// Fold a newly arrived message into the list.
    ///
    /// Updates the preview when the message is newer than the current one and
    /// counts it as unread unless the user is viewing the chat or wrote it.
    pub fn record_message(&mut self, message: &Message, active: Option<ChatId>, self_id: UserId) {
        let Some(chat) = self.chats.iter_mut().find(|c| c.id == message.chat_id) else {
            return;
        };

        let newer = chat
            .last_message
            .as_ref()
            .is_none_or(|p| (p.created_at, p.message_id) < message.sort_key());
        if newer {
            chat.last_message = Some(message.preview());
        }
        if active != Some(message.chat_id) && message.sender.user_id != self_id {
            chat.unread_count = chat.unread_count.saturating_add(1);
        }
    }

    /// Chat by ID.
    pub fn get(&self, chat_id: ChatId) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == chat_id)
    }

    /// Chats in server order.
    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    /// Sum of all unread counters.
    pub fn total_unread(&self) -> u32 {
        self.chats.iter().map(|c| c.unread_count).fold(0, u32::saturating_add)
    }

    /// List rows, most recently active first.
    ///
    /// Chats without messages keep server order at the end.
    pub fn summaries(&self, current_user: UserId, selected: Option<ChatId>) -> Vec<ChatSummary> {
        let mut rows: Vec<ChatSummary> = self
            .chats
            .iter()
            .map(|chat| ChatSummary {
                chat_id: chat.id,
                title: chat.display_name(current_user),
                subject: chat.subject.clone(),
                unread_count: chat.unread_count,
                last_message: chat.last_message.as_ref().map(|p| p.content.clone()),
                last_activity: chat.last_message.as_ref().map(|p| p.created_at),
                selected: selected == Some(chat.id),
            })
            .collect();
        rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        rows
    }
}
