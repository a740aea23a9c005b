//! LessonHub chat session
//!
//! Sans-IO state machines behind the forum chat: one push channel per selected
//! chat, reconciliation of REST and push deliveries into one ordered message
//! list, remote typing presence, and the session controller that serializes
//! chat switches.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────────────────────────┐
//!  intents ──────>│            ChatSession              │──> SessionAction
//!  results ──────>│ ┌───────────────┐ ┌───────────────┐ │
//!  ticks   ──────>│ │ Connection    │ │  Reconciler   │ │
//!                 │ │ Manager       │ │  (cache)      │ │
//!                 │ └───────────────┘ └───────────────┘ │
//!                 │ ┌───────────────┐ ┌───────────────┐ │
//!                 │ │ TypingTracker │ │ ChatDirectory │ │
//!                 │ └───────────────┘ └───────────────┘ │
//!                 └─────────────────────────────────────┘
//!                                  │
//!                                  └──> ChatView
//! ```
//!
//! Every component takes the current time as a parameter and returns the
//! work to perform instead of performing it, so the whole layer runs under
//! virtual time in tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod chat_list;
pub mod connection;
pub mod error;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod view;

pub use chat_list::{ChatDirectory, ChatSummary};
pub use connection::{
    ChannelEvent, ChannelState, ConnectionAction, ConnectionManager, Generation, ObserverId,
};
pub use error::{ConnectionError, SendError};
pub use presence::{TimerToken, TypingTracker};
pub use reconciler::{
    ApplyOutcome, Entry, LocalId, MessageKey, PendingMessage, PendingState, Reconciler,
};
pub use session::{ChatSession, RequestId, SessionAction, SessionEvent};
pub use view::{BannerKind, ChatView, ErrorBanner, MessageRow, RowStatus, SessionPhase};
