//! Chat domain model.
//!
//! Shapes of the records exchanged with the REST and push collaborators.
//! Timestamps are milliseconds since the Unix epoch as assigned by the server.

use serde::{Deserialize, Serialize};

/// Server-assigned chat identifier.
pub type ChatId = u64;

/// Server-assigned message identifier. Monotonic per server.
pub type MessageId = u64;

/// Platform user identifier.
pub type UserId = u64;

/// Platform role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Enrolled learner.
    Student,
    /// Course teacher.
    Teacher,
    /// Private tutor.
    Tutor,
    /// Parent or guardian of a student.
    Parent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Tutor => "tutor",
            Self::Parent => "parent",
        };
        f.write_str(name)
    }
}

/// Read-only authentication context supplied by the session provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Signed-in user.
    pub user_id: UserId,
    /// Display name of the signed-in user.
    pub display_name: String,
    /// Role of the signed-in user.
    pub role: Role,
    /// Bearer token for the push channel. `None` when signed out.
    pub token: Option<String>,
}

impl AuthContext {
    /// Whether a usable token is present.
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Sender identity for messages authored by this user.
    pub fn sender(&self) -> Sender {
        Sender { user_id: self.user_id, display_name: self.display_name.clone() }
    }
}

/// Chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant's user ID.
    pub user_id: UserId,
    /// Name shown in chat titles.
    pub display_name: String,
    /// Participant's platform role.
    pub role: Role,
}

/// Summary of the most recent message in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    /// Message ID.
    pub message_id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Message text.
    pub content: String,
    /// Creation timestamp (ms).
    pub created_at: u64,
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat ID.
    pub id: ChatId,
    /// Explicit chat name. `None` for direct conversations.
    pub name: Option<String>,
    /// Optional subject tag (e.g. "Algebra").
    pub subject: Option<String>,
    /// Participants in display order.
    pub participants: Vec<Participant>,
    /// Unread messages for the current user.
    pub unread_count: u32,
    /// Most recent message. `None` for empty chats.
    pub last_message: Option<MessagePreview>,
}

impl Chat {
    /// Title shown in the chat list.
    ///
    /// Uses the explicit name when present, otherwise the names of all
    /// participants other than `current_user`.
    pub fn display_name(&self, current_user: UserId) -> String {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }

        let others: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| p.user_id != current_user)
            .map(|p| p.display_name.as_str())
            .collect();

        if others.is_empty() { format!("Chat {}", self.id) } else { others.join(", ") }
    }
}

/// Kind of file attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Inline image.
    Image,
    /// Downloadable file.
    File,
}

/// A single file or image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Image or file.
    pub kind: AttachmentKind,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Download URL. `None` until uploaded.
    pub url: Option<String>,
}

/// Message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Author's user ID.
    pub user_id: UserId,
    /// Author's display name.
    pub display_name: String,
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Authored by a participant.
    #[default]
    Text,
    /// Generated by the platform (joins, schedule changes).
    System,
}

/// A server-confirmed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned ID, authoritative for deduplication.
    pub id: MessageId,
    /// Owning chat.
    pub chat_id: ChatId,
    /// Author.
    pub sender: Sender,
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Creation timestamp (ms).
    pub created_at: u64,
    /// Last edit timestamp (ms). `None` if never edited.
    pub updated_at: Option<u64>,
    /// Whether the content was edited.
    pub edited: bool,
    /// Whether the current user has read the message.
    pub read: bool,
    /// Text or system message.
    pub kind: MessageKind,
}

impl Message {
    /// Display ordering key: creation time, then ID.
    pub fn sort_key(&self) -> (u64, MessageId) {
        (self.created_at, self.id)
    }

    /// Summary for the chat list.
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            message_id: self.id,
            sender_id: self.sender.user_id,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

/// Content the user is about to send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDraft {
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    /// Text-only draft.
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), attachment: None }
    }
}

/// A remote user shown in the typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    /// User ID.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
}

/// Events delivered by the push channel of one chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// New message broadcast.
    Message(Message),
    /// Existing message edited.
    MessageEdited(Message),
    /// Message deleted.
    MessageDeleted {
        /// Deleted message ID.
        message_id: MessageId,
    },
    /// A participant started or continued typing.
    Typing(TypingUser),
    /// A participant stopped typing.
    TypingStop(TypingUser),
    /// Server-side error report for this channel.
    Error {
        /// Error description.
        message: String,
    },
}

/// Events the client sends over a push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Local user is typing.
    Typing,
    /// Local user stopped typing.
    TypingStop,
}
