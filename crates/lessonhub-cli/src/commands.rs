//! Input line parsing.
//!
//! Lines starting with `/` are commands; anything else is sent as a message
//! to the selected chat.

use lessonhub_chat::LocalId;
use lessonhub_core::{ChatId, MessageId};
use thiserror::Error;

/// Help text printed by `/help`.
pub const HELP: &str = "\
commands:
  /open <chat>           switch to a chat
  /close                 deselect the current chat
  /chats                 reload the chat list
  /show                  print the current view
  /older                 load older messages
  /typing                tell the chat you are typing
  /edit <id> <text>      edit one of your messages
  /delete <id>           delete one of your messages
  /resend <local>        retry a failed message
  /discard <local>       drop a failed message
  /retry                 retry what the error banner offers
  /dismiss               hide the error banner
  /login                 re-authenticate with a fresh token
  /incoming <chat> <text>  simulate a message from the tutor
  /drop <chat>           simulate a network drop
  /quit                  exit
anything else is sent to the selected chat";

/// Parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch to a chat.
    Open(ChatId),
    /// Deselect the current chat.
    Close,
    /// Reload the chat list.
    Chats,
    /// Print the current view.
    Show,
    /// Load older history.
    Older,
    /// Send a typing notification.
    Typing,
    /// Edit an own message.
    Edit(MessageId, String),
    /// Delete an own message.
    Delete(MessageId),
    /// Retry a failed message.
    Resend(LocalId),
    /// Drop a failed message.
    Discard(LocalId),
    /// Retry whatever the banner offers.
    Retry,
    /// Hide the banner.
    Dismiss,
    /// Re-authenticate.
    Login,
    /// Inject a message from another participant.
    Incoming(ChatId, String),
    /// Drop a chat's push channel.
    Drop(ChatId),
    /// Print help.
    Help,
    /// Exit.
    Quit,
    /// Send text to the selected chat.
    Send(String),
}

/// Rejected input line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Command name not recognized.
    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    /// Arguments missing or malformed.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    let rest = rest.trim();
    let parsed = match name {
        "open" | "o" => Command::Open(id(rest, "/open <chat>")?),
        "close" => Command::Close,
        "chats" => Command::Chats,
        "show" | "s" => Command::Show,
        "older" => Command::Older,
        "typing" => Command::Typing,
        "edit" => {
            let (message_id, text) = id_and_text(rest, "/edit <id> <text>")?;
            Command::Edit(message_id, text)
        },
        "delete" => Command::Delete(id(rest, "/delete <id>")?),
        "resend" => Command::Resend(id(rest, "/resend <local>")?),
        "discard" => Command::Discard(id(rest, "/discard <local>")?),
        "retry" => Command::Retry,
        "dismiss" => Command::Dismiss,
        "login" => Command::Login,
        "incoming" => {
            let (chat_id, text) = id_and_text(rest, "/incoming <chat> <text>")?;
            Command::Incoming(chat_id, text)
        },
        "drop" => Command::Drop(id(rest, "/drop <chat>")?),
        "help" | "h" => Command::Help,
        "quit" | "q" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(parsed))
}

fn id(arg: &str, usage: &'static str) -> Result<u64, ParseError> {
    arg.parse().map_err(|_| ParseError::Usage(usage))
}

fn id_and_text(rest: &str, usage: &'static str) -> Result<(u64, String), ParseError> {
    let (raw_id, text) = rest.split_once(char::is_whitespace).ok_or(ParseError::Usage(usage))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    Ok((id(raw_id, usage)?, text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent() {
        assert_eq!(parse("  hello there "), Ok(Some(Command::Send("hello there".into()))));
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn commands_with_ids() {
        assert_eq!(parse("/open 3"), Ok(Some(Command::Open(3))));
        assert_eq!(parse("/o 3"), Ok(Some(Command::Open(3))));
        assert_eq!(parse("/delete 12"), Ok(Some(Command::Delete(12))));
        assert_eq!(parse("/resend 2"), Ok(Some(Command::Resend(2))));
    }

    #[test]
    fn commands_with_text() {
        assert_eq!(parse("/edit 4  fixed typo"), Ok(Some(Command::Edit(4, "fixed typo".into()))));
        assert_eq!(
            parse("/incoming 1 see you at 5"),
            Ok(Some(Command::Incoming(1, "see you at 5".into())))
        );
    }

    #[test]
    fn malformed_arguments_show_usage() {
        assert_eq!(parse("/open"), Err(ParseError::Usage("/open <chat>")));
        assert_eq!(parse("/open abc"), Err(ParseError::Usage("/open <chat>")));
        assert_eq!(parse("/edit 4"), Err(ParseError::Usage("/edit <id> <text>")));
        assert_eq!(parse("/edit x hi"), Err(ParseError::Usage("/edit <id> <text>")));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = parse("/frobnicate").unwrap_err();
        assert_eq!(err, ParseError::Unknown("frobnicate".into()));
        assert_eq!(err.to_string(), "unknown command /frobnicate, try /help");
    }
}
