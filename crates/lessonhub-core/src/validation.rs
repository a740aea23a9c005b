//! Client-side draft validation.
//!
//! Runs before any network call. Failures are reported to the composer and
//! never reach the session's error banner.

use crate::{error::ValidationError, model::MessageDraft};

/// Maximum message length in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Maximum attachment size (10 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Validate a draft before sending.
///
/// A draft needs either non-blank text or an attachment.
pub fn validate_draft(draft: &MessageDraft) -> Result<(), ValidationError> {
    if let Some(attachment) = &draft.attachment {
        if attachment.size_bytes > MAX_ATTACHMENT_BYTES {
            return Err(ValidationError::AttachmentTooLarge {
                size: attachment.size_bytes,
                max: MAX_ATTACHMENT_BYTES,
            });
        }
    } else if draft.content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    check_length(&draft.content)
}

/// Validate replacement text for an edit.
pub fn validate_edit(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    check_length(content)
}

fn check_length(content: &str) -> Result<(), ValidationError> {
    let len = content.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ValidationError::TooLong { len, max: MAX_CONTENT_CHARS });
    }
    Ok(())
}
