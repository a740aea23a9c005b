//! Message reconciliation.
//!
//! Keeps one authoritative, deduplicated, ordered message list per chat,
//! fed by two producers: REST confirmations and push events. A third source,
//! optimistic sends, holds provisional entries until the server confirms.
//!
//! # Storage
//!
//! Each chat keeps its confirmed messages in a `BTreeMap` keyed by
//! `(created_at, id)` plus an id index, so deduplication is a map lookup and
//! the display order falls out of iteration. Display order therefore depends
//! only on the message set, never on arrival order.
//!
//! # Invalidation
//!
//! Every message inserted by [`Reconciler::apply_incoming`] marks its chat
//! for a chat-list refresh (unread counts, last-message preview). Callers
//! drain the marks with [`Reconciler::take_invalidations`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use lessonhub_core::{ChatId, Message, MessageDraft, MessageId, Sender};

/// Client-side identifier of an optimistic message.
pub type LocalId = u64;

/// Key of a rendered entry.
///
/// Confirmed entries sort before pending ones sharing a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKey {
    /// Server-confirmed message.
    Confirmed(MessageId),
    /// Optimistic message awaiting confirmation.
    Pending(LocalId),
}

/// Result of inserting a server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Message was new and is now cached.
    Inserted,
    /// A message with the same ID was already cached.
    Duplicate,
    /// Message belongs to a different chat than the one it was applied to.
    Misrouted,
}

/// Delivery state of an optimistic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// Send request in flight.
    Sending,
    /// Send failed; may be retried or discarded.
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Optimistic message shown before the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Client-side identifier.
    pub local_id: LocalId,
    /// Local author.
    pub sender: Sender,
    /// Draft being sent.
    pub draft: MessageDraft,
    /// Local timestamp (ms).
    pub created_at: u64,
    /// Delivery state.
    pub state: PendingState,
}

/// Borrowed cache entry in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    /// Server-confirmed message.
    Confirmed(&'a Message),
    /// Optimistic message.
    Pending(&'a PendingMessage),
}

impl Entry<'_> {
    /// Display key of the entry.
    pub fn key(&self) -> MessageKey {
        match self {
            Self::Confirmed(m) => MessageKey::Confirmed(m.id),
            Self::Pending(p) => MessageKey::Pending(p.local_id),
        }
    }

    /// Timestamp used for ordering.
    pub fn created_at(&self) -> u64 {
        match self {
            Self::Confirmed(m) => m.created_at,
            Self::Pending(p) => p.created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ChatMessages {
    ordered: BTreeMap<(u64, MessageId), Message>,
    /// Message ID to creation timestamp.
    index: HashMap<MessageId, u64>,
    pending: BTreeMap<LocalId, PendingMessage>,
}

impl ChatMessages {
    fn insert(&mut self, message: Message) -> ApplyOutcome {
        if self.index.contains_key(&message.id) {
            return ApplyOutcome::Duplicate;
        }
        self.index.insert(message.id, message.created_at);
        self.ordered.insert(message.sort_key(), message);
        ApplyOutcome::Inserted
    }

    fn get_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        let created_at = *self.index.get(&message_id)?;
        self.ordered.get_mut(&(created_at, message_id))
    }
}

/// Per-chat message cache with idempotent inserts.
///
/// The reconciler is the cache's only writer. Views borrow it read-only.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    chats: HashMap<ChatId, ChatMessages>,
    next_local_id: LocalId,
    invalidated: BTreeSet<ChatId>,
}

impl Reconciler {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a server message unless its ID is already cached.
    ///
    /// Applying the same message twice, from any mix of REST and push, leaves
    /// exactly one entry.
    pub fn apply_incoming(&mut self, chat_id: ChatId, message: Message) -> ApplyOutcome {
        if message.chat_id != chat_id {
            tracing::warn!(
                chat_id,
                message_chat = message.chat_id,
                message_id = message.id,
                "message routed to wrong chat"
            );
            return ApplyOutcome::Misrouted;
        }

        let message_id = message.id;
        let outcome = self.chats.entry(chat_id).or_default().insert(message);
        match outcome {
            ApplyOutcome::Inserted => {
                self.invalidated.insert(chat_id);
            },
            ApplyOutcome::Duplicate => {
                tracing::trace!(chat_id, message_id, "duplicate message ignored");
            },
            ApplyOutcome::Misrouted => {},
        }
        outcome
    }

    /// Insert a fetched history page. Returns the number of new messages.
    ///
    /// History does not mark the chat list for refresh.
    pub fn apply_history(&mut self, chat_id: ChatId, messages: Vec<Message>) -> usize {
        let chat = self.chats.entry(chat_id).or_default();
        messages
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| chat.insert(m))
            .filter(|outcome| *outcome == ApplyOutcome::Inserted)
            .count()
    }

    /// Show a draft immediately, before the server confirms it.
    pub fn apply_optimistic(
        &mut self,
        chat_id: ChatId,
        sender: Sender,
        draft: MessageDraft,
        created_at: u64,
    ) -> LocalId {
        self.next_local_id += 1;
        let local_id = self.next_local_id;
        let pending =
            PendingMessage { local_id, sender, draft, created_at, state: PendingState::Sending };
        self.chats.entry(chat_id).or_default().pending.insert(local_id, pending);
        local_id
    }

    /// Replace an optimistic message with the server's record.
    ///
    /// If the record already arrived over push, only the provisional entry is
    /// dropped. A record for another chat leaves the provisional entry in place.
    pub fn confirm(
        &mut self,
        chat_id: ChatId,
        local_id: LocalId,
        message: Message,
    ) -> ApplyOutcome {
        if message.chat_id != chat_id {
            tracing::warn!(
                chat_id,
                local_id,
                message_chat = message.chat_id,
                message_id = message.id,
                "confirmation routed to wrong chat"
            );
            return ApplyOutcome::Misrouted;
        }
        if let Some(chat) = self.chats.get_mut(&chat_id) {
            chat.pending.remove(&local_id);
        }
        self.apply_incoming(chat_id, message)
    }

    /// Find the optimistic message a pushed record most likely confirms.
    ///
    /// Matches the oldest in-flight entry by the same author with the same
    /// content, so a push that overtakes the REST response does not show the
    /// message twice.
    pub fn match_pending(&self, chat_id: ChatId, message: &Message) -> Option<LocalId> {
        let chat = self.chats.get(&chat_id)?;
        chat.pending
            .values()
            .find(|p| {
                p.state == PendingState::Sending
                    && p.sender.user_id == message.sender.user_id
                    && p.draft.content == message.content
            })
            .map(|p| p.local_id)
    }

    /// Mark an optimistic message as failed. Returns `false` if unknown.
    pub fn fail_optimistic(&mut self, chat_id: ChatId, local_id: LocalId, reason: String) -> bool {
        match self.pending_mut(chat_id, local_id) {
            Some(pending) => {
                pending.state = PendingState::Failed { reason };
                true
            },
            None => false,
        }
    }

    /// Move a failed optimistic message back to sending.
    ///
    /// Returns the draft to resend, or `None` if the message is unknown or
    /// not failed.
    pub fn retry_pending(&mut self, chat_id: ChatId, local_id: LocalId) -> Option<MessageDraft> {
        let pending = self.pending_mut(chat_id, local_id)?;
        if pending.state == PendingState::Sending {
            return None;
        }
        pending.state = PendingState::Sending;
        Some(pending.draft.clone())
    }

    /// Drop an optimistic message. Returns `false` if unknown.
    pub fn discard_pending(&mut self, chat_id: ChatId, local_id: LocalId) -> bool {
        self.chats.get_mut(&chat_id).is_some_and(|c| c.pending.remove(&local_id).is_some())
    }

    /// Replace a cached message with its edited version.
    ///
    /// Ignores edits for unknown messages and edits older than the cached
    /// copy. Returns `true` if the cache changed.
    pub fn apply_edit(&mut self, chat_id: ChatId, message: Message) -> bool {
        let Some(cached) = self.chats.get_mut(&chat_id).and_then(|c| c.get_mut(message.id)) else {
            return false;
        };
        if cached.updated_at > message.updated_at {
            tracing::trace!(chat_id, message_id = message.id, "stale edit ignored");
            return false;
        }

        cached.content = message.content;
        cached.attachment = message.attachment;
        cached.updated_at = message.updated_at;
        cached.edited = true;
        true
    }

    /// Remove a message. Returns `true` if it was cached.
    pub fn apply_delete(&mut self, chat_id: ChatId, message_id: MessageId) -> bool {
        let Some(chat) = self.chats.get_mut(&chat_id) else {
            return false;
        };
        let Some(created_at) = chat.index.remove(&message_id) else {
            return false;
        };
        chat.ordered.remove(&(created_at, message_id)).is_some()
    }

    /// Purge a chat's cached messages, pending ones included.
    pub fn clear(&mut self, chat_id: ChatId) {
        if self.chats.remove(&chat_id).is_some() {
            tracing::debug!(chat_id, "message cache cleared");
        }
    }

    /// Whether any messages are cached for the chat.
    pub fn has_chat(&self, chat_id: ChatId) -> bool {
        self.chats.contains_key(&chat_id)
    }

    /// Chats with a cache entry.
    pub fn cached_chats(&self) -> impl Iterator<Item = ChatId> + '_ {
        self.chats.keys().copied()
    }

    /// Whether a confirmed message is cached.
    pub fn contains(&self, chat_id: ChatId, message_id: MessageId) -> bool {
        self.chats.get(&chat_id).is_some_and(|c| c.index.contains_key(&message_id))
    }

    /// Confirmed message by ID.
    pub fn get(&self, chat_id: ChatId, message_id: MessageId) -> Option<&Message> {
        let chat = self.chats.get(&chat_id)?;
        let created_at = chat.index.get(&message_id)?;
        chat.ordered.get(&(*created_at, message_id))
    }

    /// Optimistic message by local ID.
    pub fn pending(&self, chat_id: ChatId, local_id: LocalId) -> Option<&PendingMessage> {
        self.chats.get(&chat_id)?.pending.get(&local_id)
    }

    /// Number of confirmed messages cached for the chat.
    pub fn len(&self, chat_id: ChatId) -> usize {
        self.chats.get(&chat_id).map_or(0, |c| c.ordered.len())
    }

    /// Confirmed messages in display order.
    pub fn messages(&self, chat_id: ChatId) -> Vec<&Message> {
        self.chats.get(&chat_id).map(|c| c.ordered.values().collect()).unwrap_or_default()
    }

    /// Confirmed and optimistic entries in display order.
    pub fn entries(&self, chat_id: ChatId) -> Vec<Entry<'_>> {
        let Some(chat) = self.chats.get(&chat_id) else {
            return Vec::new();
        };
        let mut entries: Vec<Entry<'_>> = chat
            .ordered
            .values()
            .map(Entry::Confirmed)
            .chain(chat.pending.values().map(Entry::Pending))
            .collect();
        entries.sort_by_key(|e| (e.created_at(), e.key()));
        entries
    }

    /// Drain chats marked for a chat-list refresh.
    pub fn take_invalidations(&mut self) -> Vec<ChatId> {
        std::mem::take(&mut self.invalidated).into_iter().collect()
    }

    fn pending_mut(&mut self, chat_id: ChatId, local_id: LocalId) -> Option<&mut PendingMessage> {
        self.chats.get_mut(&chat_id)?.pending.get_mut(&local_id)
    }
}
