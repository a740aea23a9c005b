//! Error types for the chat session layer.
//!
//! [`ConnectionError`] covers push channel failures that must be surfaced to
//! the user. [`SendError`] covers composer-side rejections which stay local to
//! the input and never reach the session banner.

use lessonhub_core::{ChatId, MessageId, ValidationError};
use thiserror::Error;

use crate::reconciler::LocalId;

/// Fatal push channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No usable credentials when connecting.
    #[error("not signed in: cannot open chat {chat_id}")]
    Unauthenticated {
        /// Chat that was being opened
        chat_id: ChatId,
    },

    /// Server rejected the channel's credentials.
    #[error("authentication rejected for chat {chat_id}: {reason}")]
    AuthRejected {
        /// Chat whose channel was rejected
        chat_id: ChatId,
        /// Server-provided reason
        reason: String,
    },
}

impl ConnectionError {
    /// Chat the error belongs to.
    pub fn chat_id(&self) -> ChatId {
        match self {
            Self::Unauthenticated { chat_id } | Self::AuthRejected { chat_id, .. } => *chat_id,
        }
    }
}

/// Composer-side rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Draft failed validation.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// No chat is selected.
    #[error("no chat selected")]
    NoActiveChat,

    /// Message is not in the selected chat's cache.
    #[error("message {message_id} not found in chat {chat_id}")]
    UnknownMessage {
        /// Selected chat
        chat_id: ChatId,
        /// Requested message
        message_id: MessageId,
    },

    /// Only the author may edit or delete a message.
    #[error("only the author can change message {message_id}")]
    NotAuthor {
        /// Requested message
        message_id: MessageId,
    },

    /// No failed optimistic message with this local ID.
    #[error("no failed message with local id {local_id}")]
    UnknownPending {
        /// Requested local ID
        local_id: LocalId,
    },
}
