//! LessonHub chat core
//!
//! Domain types shared by every layer of the forum chat client: chats,
//! messages, push events, the [`env::Environment`] abstraction that decouples
//! state machines from wall time and randomness, and the error taxonomy.
//!
//! Nothing in this crate performs I/O.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod env;
pub mod error;
pub mod model;
pub mod validation;

pub use backoff::ReconnectPolicy;
pub use env::{Environment, Instant};
pub use error::{ApiError, TransportError, ValidationError};
pub use model::{
    Attachment, AttachmentKind, AuthContext, Chat, ChatId, Message, MessageDraft, MessageId,
    MessageKind, MessagePreview, OutboundEvent, Participant, PushEvent, Role, Sender, TypingUser,
    UserId,
};
