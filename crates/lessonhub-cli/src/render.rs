//! Plain-text rendering of a [`ChatView`].
//!
//! Pure formatting into any writer; the binary points it at a locked stdout
//! and tests at a byte buffer.

use std::io::{self, Write};

use lessonhub_chat::{
    ChannelState, ChatSummary, ChatView, MessageKey, MessageRow, RowStatus, SessionPhase,
};
use lessonhub_core::TypingUser;

/// Render the whole view.
pub fn render(out: &mut impl Write, view: &ChatView) -> io::Result<()> {
    if let Some(banner) = &view.banner {
        let hint = if banner.retryable { " (/retry)" } else { "" };
        writeln!(out, "!! {}{hint}", banner.message)?;
    }

    render_chats(out, &view.chats)?;
    writeln!(out)?;

    let Some(chat_id) = view.selected else {
        return writeln!(out, "Select a chat with /open <chat>");
    };
    let title = view.title.as_deref().unwrap_or("Chat");
    writeln!(out, "== {title} [{chat_id}] {} ==", status_label(view))?;

    if view.is_switching() {
        return writeln!(out, "   loading...");
    }
    if view.history_loading {
        writeln!(out, "   loading older messages...")?;
    } else if !view.history_exhausted && !view.messages.is_empty() {
        writeln!(out, "   (/older for earlier messages)")?;
    }
    if view.messages.is_empty() && !view.history_loading {
        writeln!(out, "   no messages yet")?;
    }
    for row in &view.messages {
        render_row(out, row)?;
    }
    if let Some(line) = typing_line(&view.typing) {
        writeln!(out, "   {line}")?;
    }
    Ok(())
}

fn render_chats(out: &mut impl Write, chats: &[ChatSummary]) -> io::Result<()> {
    if chats.is_empty() {
        return writeln!(out, "no chats");
    }
    for chat in chats {
        let marker = if chat.selected { '>' } else { ' ' };
        let unread = if chat.unread_count > 0 {
            format!(" ({} new)", chat.unread_count)
        } else {
            String::new()
        };
        let subject = chat.subject.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default();
        let last = chat.last_message.as_deref().unwrap_or("");
        writeln!(out, "{marker} {:>3} {}{subject}{unread}  {last}", chat.chat_id, chat.title)?;
    }
    Ok(())
}

fn render_row(out: &mut impl Write, row: &MessageRow) -> io::Result<()> {
    let id = match row.key {
        MessageKey::Confirmed(id) => format!("#{id}"),
        MessageKey::Pending(local) => format!("~{local}"),
    };
    let author = if row.own { "you" } else { row.sender.display_name.as_str() };
    let edited = if row.edited { " (edited)" } else { "" };
    let status = match &row.status {
        RowStatus::Confirmed => String::new(),
        RowStatus::Sending => " [sending]".to_string(),
        RowStatus::Failed { reason } => format!(" [failed: {reason}]"),
    };
    writeln!(out, "{id:>6} <{author}> {}{edited}{status}", row.content)?;
    if let Some(attachment) = &row.attachment {
        writeln!(out, "         + {} ({} bytes)", attachment.file_name, attachment.size_bytes)?;
    }
    Ok(())
}

fn status_label(view: &ChatView) -> &'static str {
    if view.phase == SessionPhase::Error {
        return "error";
    }
    match view.connection {
        ChannelState::Disconnected => "offline",
        ChannelState::Connecting => "connecting",
        ChannelState::Connected => "live",
        ChannelState::Reconnecting => "reconnecting",
        ChannelState::Failed => "signed out",
    }
}

/// "Ann is typing...", "Ann and Bo are typing...", "3 people are typing...".
fn typing_line(typing: &[TypingUser]) -> Option<String> {
    match typing {
        [] => None,
        [one] => Some(format!("{} is typing...", one.display_name)),
        [a, b] => Some(format!("{} and {} are typing...", a.display_name, b.display_name)),
        many => Some(format!("{} people are typing...", many.len())),
    }
}
