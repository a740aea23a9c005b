//! Error types shared across the chat layers.
//!
//! Strongly-typed errors for the collaborator boundaries (REST API, push
//! transport) and for client-side validation. Each type classifies itself so
//! callers can decide between automatic retry, a retry banner, or a forced
//! re-authentication without matching on message strings.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the REST collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request could not reach the server.
    #[error("network error: {0}")]
    Network(String),

    /// Request did not complete in time.
    #[error("request timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Credentials missing, invalid or expired.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced chat or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Server rejected the request.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP-style status code
        status: u16,
        /// Server-provided description
        message: String,
    },
}

impl ApiError {
    /// Returns true if the request may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Unauthorized(_) | Self::NotFound(_) => false,
        }
    }

    /// Returns true if the user must re-authenticate.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Errors produced by the push transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Channel could not be established or broke.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server rejected the channel's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Channel closed by the peer.
    #[error("channel closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Returns true if the user must re-authenticate.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Draft rejected before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No text and no attachment.
    #[error("message is empty")]
    Empty,

    /// Text exceeds the length limit.
    #[error("message has {len} characters, limit is {max}")]
    TooLong {
        /// Character count of the draft
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Attachment exceeds the size limit.
    #[error("attachment is {size} bytes, limit is {max}")]
    AttachmentTooLarge {
        /// Attachment size
        size: u64,
        /// Allowed maximum
        max: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(ApiError::Timeout { elapsed: Duration::from_secs(5) }.is_transient());
        assert!(ApiError::Server { status: 503, message: "busy".into() }.is_transient());
        assert!(!ApiError::Server { status: 400, message: "bad".into() }.is_transient());
        assert!(!ApiError::Unauthorized("expired".into()).is_transient());
        assert!(!ApiError::NotFound("chat 9".into()).is_transient());
    }

    #[test]
    fn auth_classification() {
        assert!(ApiError::Unauthorized("expired".into()).is_auth());
        assert!(!ApiError::Network("down".into()).is_auth());
        assert!(TransportError::Unauthorized("expired".into()).is_auth());
        assert!(!TransportError::Closed("eof".into()).is_auth());
    }

    #[test]
    fn display_messages() {
        let err = ValidationError::TooLong { len: 5001, max: 4000 };
        assert_eq!(err.to_string(), "message has 5001 characters, limit is 4000");

        let err = ApiError::Server { status: 502, message: "gateway".into() };
        assert_eq!(err.to_string(), "server error (502): gateway");
    }
}
