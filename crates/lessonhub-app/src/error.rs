//! Runtime error types.

use lessonhub_chat::SendError;
use thiserror::Error;

/// Errors returned by [`crate::RuntimeHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime has shut down.
    #[error("chat runtime stopped")]
    Stopped,

    /// The session rejected the command.
    #[error(transparent)]
    Rejected(#[from] SendError),
}

impl RuntimeError {
    /// Returns true if the command failed because of its input.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
