//! Chat session controller.
//!
//! Orchestrates the connection manager, the reconciler, the typing tracker and
//! the chat directory for the chat the user has selected. Like its parts, the
//! session is Sans-IO: user intents and collaborator results go in, together
//! with the current time, and [`SessionAction`]s come out.
//!
//! # Phases
//!
//! ```text
//!            select            settled
//!   Idle ──────────> Switching ───────> Active
//!    ^                 │   ^              │
//!    │ clear           │   │ retry        │
//!    │                 ↓   │              │
//!    └─────────────── Error <─────────────┘
//!                        auth failure
//! ```
//!
//! # Switching
//!
//! A selection change runs teardown and setup inside one call, so two switches
//! can never interleave:
//!
//! 1. cancel history requests of the previous chat
//! 2. stop typing and close the previous channel
//! 3. purge the previous chat's messages and typing state
//! 4. clear the error banner
//! 5. open the new channel, fetch its history and mark it read
//!
//! The session then reports `Switching` until the channel is live and
//! [`MIN_SWITCH_DISPLAY`] has elapsed. Results of abandoned requests are
//! dropped by request ID; push events of closed channels by generation.

use std::{collections::HashMap, time::Duration};

use lessonhub_core::{
    ApiError, AuthContext, Chat, ChatId, Environment, Message, MessageDraft, MessageId,
    OutboundEvent, PushEvent, ReconnectPolicy, UserId, validation,
};

use crate::{
    chat_list::ChatDirectory,
    connection::{
        ChannelEvent, ChannelState, ConnectionAction, ConnectionManager, Generation, ObserverId,
    },
    error::{ConnectionError, SendError},
    presence::{TimerToken, TypingTracker},
    reconciler::{ApplyOutcome, Entry, LocalId, PendingState, Reconciler},
    view::{BannerKind, ChatView, ErrorBanner, MessageRow, RowStatus, SessionPhase},
};

/// Minimum time the switching placeholder stays visible.
pub const MIN_SWITCH_DISPLAY: Duration = Duration::from_millis(300);

/// Messages requested per history page.
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Identifies one collaborator request issued by the session.
pub type RequestId = u64;

/// Collaborator calls the runtime must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Load the chat list.
    FetchChatList {
        /// Tag for the result
        request_id: RequestId,
    },
    /// Load a page of history, newest first.
    FetchHistory {
        /// Tag for the result
        request_id: RequestId,
        /// Chat to load
        chat_id: ChatId,
        /// Page size
        limit: usize,
        /// Messages to skip from the newest end
        offset: usize,
    },
    /// Abort an in-flight request. Its result, if any, is ignored.
    CancelRequest {
        /// Request to abort
        request_id: RequestId,
    },
    /// Open a push channel with the session's credentials.
    OpenChannel {
        /// Room to subscribe to
        chat_id: ChatId,
        /// Tag for every event of this channel
        generation: Generation,
    },
    /// Close a push channel.
    CloseChannel {
        /// Room to unsubscribe from
        chat_id: ChatId,
        /// Channel to close
        generation: Generation,
    },
    /// Send an event over a push channel.
    SendChannelEvent {
        /// Target room
        chat_id: ChatId,
        /// Channel to send on
        generation: Generation,
        /// Event
        event: OutboundEvent,
    },
    /// Persist a new message.
    SendMessage {
        /// Tag for the result
        request_id: RequestId,
        /// Target chat
        chat_id: ChatId,
        /// Content to send
        draft: MessageDraft,
    },
    /// Replace a message's text.
    EditMessage {
        /// Tag for the result
        request_id: RequestId,
        /// Message to edit
        message_id: MessageId,
        /// Replacement text
        content: String,
    },
    /// Delete a message.
    DeleteMessage {
        /// Tag for the result
        request_id: RequestId,
        /// Message to delete
        message_id: MessageId,
    },
    /// Mark every message in a chat as read.
    MarkChatRead {
        /// Tag for the result
        request_id: RequestId,
        /// Chat being read
        chat_id: ChatId,
    },
}

/// Inputs fed back into the session by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Result of [`SessionAction::FetchChatList`].
    ChatListLoaded {
        /// Request tag
        request_id: RequestId,
        /// Chats or failure
        result: Result<Vec<Chat>, ApiError>,
    },
    /// Result of [`SessionAction::FetchHistory`].
    HistoryLoaded {
        /// Request tag
        request_id: RequestId,
        /// Messages or failure
        result: Result<Vec<Message>, ApiError>,
    },
    /// Transport event of one push channel.
    Channel {
        /// Room
        chat_id: ChatId,
        /// Channel tag
        generation: Generation,
        /// Event
        event: ChannelEvent,
    },
    /// Result of [`SessionAction::SendMessage`].
    SendCompleted {
        /// Request tag
        request_id: RequestId,
        /// Stored message or failure
        result: Result<Message, ApiError>,
    },
    /// Result of [`SessionAction::EditMessage`].
    EditCompleted {
        /// Request tag
        request_id: RequestId,
        /// Edited message or failure
        result: Result<Message, ApiError>,
    },
    /// Result of [`SessionAction::DeleteMessage`].
    DeleteCompleted {
        /// Request tag
        request_id: RequestId,
        /// Outcome
        result: Result<(), ApiError>,
    },
    /// Result of [`SessionAction::MarkChatRead`].
    MarkReadCompleted {
        /// Request tag
        request_id: RequestId,
        /// Outcome
        result: Result<(), ApiError>,
    },
    /// Periodic timer.
    Tick,
}

impl SessionEvent {
    /// Request this event answers, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::ChatListLoaded { request_id, .. }
            | Self::HistoryLoaded { request_id, .. }
            | Self::SendCompleted { request_id, .. }
            | Self::EditCompleted { request_id, .. }
            | Self::DeleteCompleted { request_id, .. }
            | Self::MarkReadCompleted { request_id, .. } => Some(*request_id),
            Self::Channel { .. } | Self::Tick => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    ChatList,
    History { chat_id: ChatId, offset: usize },
    Send { chat_id: ChatId, local_id: LocalId },
    Edit { chat_id: ChatId },
    Delete { chat_id: ChatId, message_id: MessageId },
    MarkRead { chat_id: ChatId },
}

#[derive(Debug, Clone, Default)]
struct HistoryState {
    loading: Option<RequestId>,
    exhausted: bool,
    /// Offset of the last failed page, for retry.
    failed_offset: Option<usize>,
}

/// Scheduled expiry of one remote typing entry.
#[derive(Debug, Clone, Copy)]
struct TypingTimer<I> {
    deadline: I,
    user_id: UserId,
    token: TimerToken,
}

#[derive(Debug, Clone)]
struct Selection<I> {
    chat_id: ChatId,
    phase: SessionPhase,
    since: I,
    history: HistoryState,
}

/// Controller for the selected chat.
///
/// One session per signed-in user. Owns its connection manager, so nothing
/// leaks between sessions.
pub struct ChatSession<E: Environment> {
    env: E,
    auth: AuthContext,
    connections: ConnectionManager<E>,
    cache: Reconciler,
    typing: TypingTracker<E::Instant>,
    typing_timers: Vec<TypingTimer<E::Instant>>,
    directory: ChatDirectory,
    selection: Option<Selection<E::Instant>>,
    banner: Option<ErrorBanner>,
    requests: HashMap<RequestId, Request>,
    next_request: RequestId,
    chat_list_request: Option<RequestId>,
    /// A refresh was requested while one was in flight.
    chat_list_stale: bool,
}

impl<E: Environment> ChatSession<E> {
    /// Create an idle session.
    pub fn new(env: E, auth: AuthContext, policy: ReconnectPolicy) -> Self {
        let typing = TypingTracker::new(auth.user_id);
        Self {
            connections: ConnectionManager::new(env.clone(), policy),
            env,
            auth,
            cache: Reconciler::new(),
            typing,
            typing_timers: Vec::new(),
            directory: ChatDirectory::new(),
            selection: None,
            banner: None,
            requests: HashMap::new(),
            next_request: 1,
            chat_list_request: None,
            chat_list_stale: false,
        }
    }

    /// Credentials used for new channels.
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Selected chat.
    pub fn selected(&self) -> Option<ChatId> {
        self.selection.as_ref().map(|s| s.chat_id)
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.selection.as_ref().map_or(SessionPhase::Idle, |s| s.phase)
    }

    /// Current error banner.
    pub fn banner(&self) -> Option<&ErrorBanner> {
        self.banner.as_ref()
    }

    /// Liveness of the selected chat's channel.
    pub fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    /// Message cache, read-only.
    pub fn cache(&self) -> &Reconciler {
        &self.cache
    }

    /// Chat directory, read-only.
    pub fn directory(&self) -> &ChatDirectory {
        &self.directory
    }

    /// Number of requests awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Register a channel liveness observer.
    pub fn on_connection_change(
        &mut self,
        callback: impl FnMut(ChatId, bool) + Send + 'static,
    ) -> ObserverId {
        self.connections.on_connection_change(callback)
    }

    /// Unregister a channel liveness observer.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.connections.remove_observer(id)
    }

    /// Reload the chat list.
    ///
    /// Coalesces: while a load is in flight, one more load is queued for when
    /// it completes.
    pub fn refresh_chat_list(&mut self) -> Vec<SessionAction> {
        if self.chat_list_request.is_some() {
            self.chat_list_stale = true;
            return Vec::new();
        }

        let request_id = self.issue(Request::ChatList);
        self.chat_list_request = Some(request_id);
        self.chat_list_stale = false;
        vec![SessionAction::FetchChatList { request_id }]
    }

    /// Switch to `chat_id`.
    ///
    /// Reselecting the current chat does nothing, unless the session is in
    /// the error phase, where it retries.
    pub fn select_chat(&mut self, chat_id: ChatId, now: E::Instant) -> Vec<SessionAction> {
        if let Some(selection) = &self.selection
            && selection.chat_id == chat_id
        {
            if selection.phase == SessionPhase::Error {
                return self.reselect(chat_id, now);
            }
            return Vec::new();
        }

        tracing::info!(chat_id, previous = ?self.selected(), "switching chat");
        self.reselect(chat_id, now)
    }

    /// Deselect the current chat.
    pub fn clear_selection(&mut self) -> Vec<SessionAction> {
        self.teardown()
    }

    /// Act on the banner's retry button.
    ///
    /// Connection and auth failures re-run the whole switch for the selected
    /// chat. History and chat-list failures repeat only the failed load.
    pub fn retry(&mut self, now: E::Instant) -> Vec<SessionAction> {
        let kind = self.banner.as_ref().map(|b| b.kind);
        match (kind, self.selected()) {
            (Some(BannerKind::ChatList), _) => {
                self.banner = None;
                self.refresh_chat_list()
            },
            (Some(BannerKind::History), Some(chat_id)) => {
                self.banner = None;
                let offset = self
                    .selection
                    .as_mut()
                    .and_then(|s| s.history.failed_offset.take())
                    .unwrap_or(0);
                self.fetch_history(chat_id, offset)
            },
            (Some(BannerKind::Update), _) => {
                self.banner = None;
                Vec::new()
            },
            (_, Some(chat_id))
                if kind.is_some() || self.phase() == SessionPhase::Error =>
            {
                self.reselect(chat_id, now)
            },
            _ => Vec::new(),
        }
    }

    /// Hide the banner without retrying.
    pub fn dismiss_error(&mut self) {
        self.banner = None;
    }

    /// Replace the credentials after re-authentication.
    ///
    /// A selection stuck on an auth failure is retried with the new
    /// credentials.
    pub fn set_auth(&mut self, auth: AuthContext, now: E::Instant) -> Vec<SessionAction> {
        tracing::info!(user_id = auth.user_id, role = %auth.role, "credentials updated");
        self.typing.set_self(auth.user_id);
        self.auth = auth;

        let auth_failed = self.banner.as_ref().is_some_and(|b| b.kind == BannerKind::Auth);
        match self.selected() {
            Some(chat_id) if auth_failed || self.phase() == SessionPhase::Error => {
                self.reselect(chat_id, now)
            },
            _ => {
                if auth_failed {
                    self.banner = None;
                }
                Vec::new()
            },
        }
    }

    /// Send a message to the selected chat.
    ///
    /// The message shows up immediately as pending. Validation failures are
    /// returned without any side effect.
    pub fn send_message(
        &mut self,
        draft: MessageDraft,
        now: E::Instant,
    ) -> Result<Vec<SessionAction>, SendError> {
        validation::validate_draft(&draft)?;
        let chat_id = self.selected().ok_or(SendError::NoActiveChat)?;

        let stopped = self.connections.stop_typing(chat_id);
        let mut actions = self.map_connection(stopped, now);
        let created_at = self.env.wall_clock_millis();
        let local_id =
            self.cache.apply_optimistic(chat_id, self.auth.sender(), draft.clone(), created_at);
        let request_id = self.issue(Request::Send { chat_id, local_id });

        tracing::debug!(chat_id, local_id, request_id, "sending message");
        actions.push(SessionAction::SendMessage { request_id, chat_id, draft });
        Ok(actions)
    }

    /// Resend a failed message.
    pub fn retry_send(&mut self, local_id: LocalId) -> Result<Vec<SessionAction>, SendError> {
        let chat_id = self.selected().ok_or(SendError::NoActiveChat)?;
        let draft = self
            .cache
            .retry_pending(chat_id, local_id)
            .ok_or(SendError::UnknownPending { local_id })?;

        let request_id = self.issue(Request::Send { chat_id, local_id });
        Ok(vec![SessionAction::SendMessage { request_id, chat_id, draft }])
    }

    /// Drop a failed message from the view.
    pub fn discard_failed(&mut self, local_id: LocalId) -> Result<(), SendError> {
        let chat_id = self.selected().ok_or(SendError::NoActiveChat)?;
        let failed = self
            .cache
            .pending(chat_id, local_id)
            .is_some_and(|p| matches!(p.state, PendingState::Failed { .. }));
        if !failed || !self.cache.discard_pending(chat_id, local_id) {
            return Err(SendError::UnknownPending { local_id });
        }
        Ok(())
    }

    /// Edit one of the local user's messages.
    pub fn edit_message(
        &mut self,
        message_id: MessageId,
        content: String,
    ) -> Result<Vec<SessionAction>, SendError> {
        validation::validate_edit(&content)?;
        let chat_id = self.own_message(message_id)?;

        let request_id = self.issue(Request::Edit { chat_id });
        Ok(vec![SessionAction::EditMessage { request_id, message_id, content }])
    }

    /// Delete one of the local user's messages.
    pub fn delete_message(
        &mut self,
        message_id: MessageId,
    ) -> Result<Vec<SessionAction>, SendError> {
        let chat_id = self.own_message(message_id)?;

        let request_id = self.issue(Request::Delete { chat_id, message_id });
        Ok(vec![SessionAction::DeleteMessage { request_id, message_id }])
    }

    /// The local user pressed a key in the composer.
    pub fn local_typing(&mut self, now: E::Instant) -> Vec<SessionAction> {
        let Some(chat_id) = self.selected() else {
            return Vec::new();
        };
        let actions = self.connections.send_typing(chat_id, now);
        self.map_connection(actions, now)
    }

    /// Load the next older page of the selected chat.
    pub fn load_older(&mut self) -> Vec<SessionAction> {
        let Some(selection) = &self.selection else {
            return Vec::new();
        };
        if selection.history.loading.is_some() || selection.history.exhausted {
            return Vec::new();
        }

        let chat_id = selection.chat_id;
        let offset = self.cache.len(chat_id);
        self.fetch_history(chat_id, offset)
    }

    /// Feed a collaborator result or timer tick into the session.
    pub fn handle(&mut self, event: SessionEvent, now: E::Instant) -> Vec<SessionAction> {
        let mut actions = match event {
            SessionEvent::ChatListLoaded { request_id, result } => {
                self.on_chat_list(request_id, result)
            },
            SessionEvent::HistoryLoaded { request_id, result } => {
                self.on_history(request_id, result);
                Vec::new()
            },
            SessionEvent::Channel { chat_id, generation, event } => {
                let actions =
                    self.connections.handle_channel_event(chat_id, generation, event, now);
                self.map_connection(actions, now)
            },
            SessionEvent::SendCompleted { request_id, result } => {
                self.on_send(request_id, result);
                Vec::new()
            },
            SessionEvent::EditCompleted { request_id, result } => {
                self.on_edit(request_id, result);
                Vec::new()
            },
            SessionEvent::DeleteCompleted { request_id, result } => {
                self.on_delete(request_id, result);
                Vec::new()
            },
            SessionEvent::MarkReadCompleted { request_id, result } => {
                if let Some(Request::MarkRead { chat_id }) = self.requests.remove(&request_id)
                    && let Err(error) = result
                {
                    tracing::warn!(chat_id, %error, "mark read failed");
                }
                Vec::new()
            },
            SessionEvent::Tick => {
                self.fire_typing_timers(now);
                let actions = self.connections.tick(now);
                self.map_connection(actions, now)
            },
        };

        self.settle(now);
        actions.extend(self.flush_invalidations());
        actions
    }

    /// Earliest instant at which a tick would change state.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        let switch = self
            .selection
            .as_ref()
            .filter(|s| s.phase == SessionPhase::Switching)
            .map(|s| s.since + MIN_SWITCH_DISPLAY);
        let typing = self.typing_timers.iter().map(|t| t.deadline).min();
        [self.connections.next_deadline(), typing, switch]
            .into_iter()
            .flatten()
            .min()
    }

    /// Snapshot for rendering.
    pub fn view(&self, now: E::Instant) -> ChatView {
        let selected = self.selected();
        let self_id = self.auth.user_id;
        let messages = selected
            .map(|chat_id| {
                self.cache
                    .entries(chat_id)
                    .into_iter()
                    .map(|entry| message_row(entry, self_id))
                    .collect()
            })
            .unwrap_or_default();

        ChatView {
            phase: self.phase(),
            selected,
            title: selected.and_then(|id| self.directory.get(id)).map(|c| c.display_name(self_id)),
            connection: selected
                .map_or(ChannelState::Disconnected, |id| self.connections.state(id)),
            messages,
            typing: self.typing.typing_users(now),
            banner: self.banner.clone(),
            chats: self.directory.summaries(self_id, selected),
            history_loading: self.selection.as_ref().is_some_and(|s| s.history.loading.is_some()),
            history_exhausted: self.selection.as_ref().is_some_and(|s| s.history.exhausted),
        }
    }

    fn reselect(&mut self, chat_id: ChatId, now: E::Instant) -> Vec<SessionAction> {
        let mut actions = self.teardown();
        actions.extend(self.setup(chat_id, now));
        actions
    }

    fn teardown(&mut self) -> Vec<SessionAction> {
        let Some(previous) = self.selection.take() else {
            self.banner = None;
            return Vec::new();
        };
        let chat_id = previous.chat_id;

        let mut cancelled: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| matches!(r, Request::History { chat_id: c, .. } if *c == chat_id))
            .map(|(&id, _)| id)
            .collect();
        cancelled.sort_unstable();

        let mut actions = Vec::with_capacity(cancelled.len() + 2);
        for request_id in cancelled {
            self.requests.remove(&request_id);
            actions.push(SessionAction::CancelRequest { request_id });
        }

        let mut teardown = self.connections.stop_typing(chat_id);
        teardown.extend(self.connections.disconnect(chat_id));
        actions.extend(teardown.into_iter().filter_map(transport_action));

        self.cache.clear(chat_id);
        self.reset_typing(None);
        self.banner = None;

        tracing::debug!(chat_id, "previous chat torn down");
        actions
    }

    fn setup(&mut self, chat_id: ChatId, now: E::Instant) -> Vec<SessionAction> {
        self.selection = Some(Selection {
            chat_id,
            phase: SessionPhase::Switching,
            since: now,
            history: HistoryState::default(),
        });
        self.reset_typing(Some(chat_id));

        let opened = match self.connections.connect(chat_id, &self.auth) {
            Ok(opened) => opened,
            Err(error) => {
                self.fail(&error);
                return Vec::new();
            },
        };

        let mut actions = self.fetch_history(chat_id, 0);
        actions.extend(self.map_connection(opened, now));

        self.directory.mark_read(chat_id);
        let request_id = self.issue(Request::MarkRead { chat_id });
        actions.push(SessionAction::MarkChatRead { request_id, chat_id });
        actions
    }

    fn reset_typing(&mut self, chat_id: Option<ChatId>) {
        self.typing.reset(chat_id);
        self.typing_timers.clear();
    }

    /// Fire due expiry timers. A refreshed entry ignores its superseded timer.
    fn fire_typing_timers(&mut self, now: E::Instant) {
        let (due, pending) = std::mem::take(&mut self.typing_timers)
            .into_iter()
            .partition::<Vec<_>, _>(|t| t.deadline <= now);
        self.typing_timers = pending;
        for timer in due {
            if self.typing.on_timer(timer.user_id, timer.token) {
                tracing::trace!(user_id = timer.user_id, "typing expired");
            }
        }
    }

    fn fetch_history(&mut self, chat_id: ChatId, offset: usize) -> Vec<SessionAction> {
        let request_id = self.issue(Request::History { chat_id, offset });
        if let Some(selection) = self.selection.as_mut() {
            selection.history.loading = Some(request_id);
        }
        vec![SessionAction::FetchHistory { request_id, chat_id, limit: HISTORY_PAGE_SIZE, offset }]
    }

    fn issue(&mut self, request: Request) -> RequestId {
        let request_id = self.next_request;
        self.next_request += 1;
        self.requests.insert(request_id, request);
        request_id
    }

    fn own_message(&self, message_id: MessageId) -> Result<ChatId, SendError> {
        let chat_id = self.selected().ok_or(SendError::NoActiveChat)?;
        let message = self
            .cache
            .get(chat_id, message_id)
            .ok_or(SendError::UnknownMessage { chat_id, message_id })?;
        if message.sender.user_id != self.auth.user_id {
            return Err(SendError::NotAuthor { message_id });
        }
        Ok(chat_id)
    }

    fn map_connection(
        &mut self,
        actions: Vec<ConnectionAction>,
        now: E::Instant,
    ) -> Vec<SessionAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                ConnectionAction::Deliver { chat_id, event } => self.deliver(chat_id, event, now),
                ConnectionAction::Failed { error } => self.fail(&error),
                other => out.extend(transport_action(other)),
            }
        }
        out
    }

    fn deliver(&mut self, chat_id: ChatId, event: PushEvent, now: E::Instant) {
        if self.selected() != Some(chat_id) {
            tracing::trace!(chat_id, "dropping push for unselected chat");
            return;
        }

        match event {
            PushEvent::Message(message) => {
                let own_pending = self.cache.match_pending(chat_id, &message);
                let outcome = match own_pending {
                    Some(local_id) => self.cache.confirm(chat_id, local_id, message.clone()),
                    None => self.cache.apply_incoming(chat_id, message.clone()),
                };
                if outcome == ApplyOutcome::Inserted {
                    self.directory.record_message(&message, Some(chat_id), self.auth.user_id);
                }
            },
            PushEvent::MessageEdited(message) => {
                self.cache.apply_edit(chat_id, message);
            },
            PushEvent::MessageDeleted { message_id } => {
                self.cache.apply_delete(chat_id, message_id);
            },
            PushEvent::Typing(user) => {
                let user_id = user.user_id;
                if let Some((token, deadline)) = self.typing.on_typing(chat_id, user, now) {
                    self.typing_timers.push(TypingTimer { deadline, user_id, token });
                }
            },
            PushEvent::TypingStop(user) => {
                self.typing.on_typing_stop(chat_id, user.user_id);
            },
            PushEvent::Error { message } => {
                tracing::warn!(chat_id, %message, "channel reported error");
                self.raise(BannerKind::Connectivity, message, true);
            },
        }
    }

    fn fail(&mut self, error: &ConnectionError) {
        if self.selected() != Some(error.chat_id()) {
            return;
        }
        if let Some(selection) = self.selection.as_mut() {
            selection.phase = SessionPhase::Error;
        }
        tracing::error!(chat_id = error.chat_id(), %error, "chat connection failed");
        self.raise_auth(error.to_string());
    }

    /// Retrying an auth banner re-runs the switch, so it needs a selection.
    fn raise_auth(&mut self, message: String) {
        let retryable = self.selected().is_some();
        self.raise(BannerKind::Auth, message, retryable);
    }

    /// Auth banners are only replaced by other auth banners.
    fn raise(&mut self, kind: BannerKind, message: String, retryable: bool) {
        if self.banner.as_ref().is_some_and(|b| b.kind == BannerKind::Auth)
            && kind != BannerKind::Auth
        {
            return;
        }
        self.banner = Some(ErrorBanner { kind, message, retryable });
    }

    fn settle(&mut self, now: E::Instant) {
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        if selection.phase == SessionPhase::Switching
            && self.connections.state(selection.chat_id) == ChannelState::Connected
            && now - selection.since >= MIN_SWITCH_DISPLAY
        {
            selection.phase = SessionPhase::Active;
            tracing::debug!(chat_id = selection.chat_id, "chat settled");
        }
    }

    fn flush_invalidations(&mut self) -> Vec<SessionAction> {
        if self.cache.take_invalidations().is_empty() {
            return Vec::new();
        }
        self.refresh_chat_list()
    }

    fn on_chat_list(
        &mut self,
        request_id: RequestId,
        result: Result<Vec<Chat>, ApiError>,
    ) -> Vec<SessionAction> {
        if self.chat_list_request != Some(request_id) {
            tracing::trace!(request_id, "dropping stale chat list");
            return Vec::new();
        }
        self.requests.remove(&request_id);
        self.chat_list_request = None;

        match result {
            Ok(chats) => {
                tracing::debug!(chats = chats.len(), "chat list loaded");
                self.directory.replace(chats, self.selected());
                if self.banner.as_ref().is_some_and(|b| b.kind == BannerKind::ChatList) {
                    self.banner = None;
                }
            },
            Err(error) => {
                tracing::warn!(%error, "chat list load failed");
                self.raise_api(BannerKind::ChatList, &error);
            },
        }

        if self.chat_list_stale { self.refresh_chat_list() } else { Vec::new() }
    }

    fn on_history(&mut self, request_id: RequestId, result: Result<Vec<Message>, ApiError>) {
        let Some(Request::History { chat_id, offset }) = self.requests.remove(&request_id) else {
            tracing::trace!(request_id, "dropping cancelled history page");
            return;
        };
        let Some(selection) = self.selection.as_mut().filter(|s| s.chat_id == chat_id) else {
            return;
        };
        if selection.history.loading == Some(request_id) {
            selection.history.loading = None;
        }

        match result {
            Ok(messages) => {
                selection.history.exhausted = messages.len() < HISTORY_PAGE_SIZE;
                let inserted = self.cache.apply_history(chat_id, messages);
                tracing::debug!(chat_id, offset, inserted, "history page loaded");
            },
            Err(error) => {
                selection.history.failed_offset = Some(offset);
                tracing::warn!(chat_id, offset, %error, "history load failed");
                self.raise_api(BannerKind::History, &error);
            },
        }
    }

    fn on_send(&mut self, request_id: RequestId, result: Result<Message, ApiError>) {
        let Some(Request::Send { chat_id, local_id }) = self.requests.remove(&request_id) else {
            return;
        };
        let selected = self.selected() == Some(chat_id);

        match result {
            Ok(message) => {
                self.directory.record_message(&message, self.selected(), self.auth.user_id);
                if selected {
                    self.cache.confirm(chat_id, local_id, message);
                }
            },
            Err(error) => {
                tracing::warn!(chat_id, local_id, %error, "send failed");
                if selected {
                    self.cache.fail_optimistic(chat_id, local_id, error.to_string());
                }
                if error.is_auth() {
                    self.raise_auth(error.to_string());
                }
            },
        }
    }

    fn on_edit(&mut self, request_id: RequestId, result: Result<Message, ApiError>) {
        let Some(Request::Edit { chat_id }) = self.requests.remove(&request_id) else {
            return;
        };
        match result {
            Ok(message) if self.selected() == Some(chat_id) => {
                self.cache.apply_edit(chat_id, message);
            },
            Ok(_) => {},
            Err(error) => {
                tracing::warn!(chat_id, %error, "edit failed");
                self.raise_api(BannerKind::Update, &error);
            },
        }
    }

    fn on_delete(&mut self, request_id: RequestId, result: Result<(), ApiError>) {
        let Some(Request::Delete { chat_id, message_id }) = self.requests.remove(&request_id)
        else {
            return;
        };
        match result {
            Ok(()) if self.selected() == Some(chat_id) => {
                self.cache.apply_delete(chat_id, message_id);
            },
            Ok(()) => {},
            Err(error) => {
                tracing::warn!(chat_id, message_id, %error, "delete failed");
                self.raise_api(BannerKind::Update, &error);
            },
        }
    }

    fn raise_api(&mut self, kind: BannerKind, error: &ApiError) {
        if error.is_auth() {
            if let Some(selection) = self.selection.as_mut() {
                selection.phase = SessionPhase::Error;
            }
            self.raise_auth(error.to_string());
        } else {
            self.raise(kind, error.to_string(), kind != BannerKind::Update);
        }
    }
}

fn transport_action(action: ConnectionAction) -> Option<SessionAction> {
    match action {
        ConnectionAction::Open { chat_id, generation } => {
            Some(SessionAction::OpenChannel { chat_id, generation })
        },
        ConnectionAction::Close { chat_id, generation } => {
            Some(SessionAction::CloseChannel { chat_id, generation })
        },
        ConnectionAction::Send { chat_id, generation, event } => {
            Some(SessionAction::SendChannelEvent { chat_id, generation, event })
        },
        ConnectionAction::Deliver { .. } | ConnectionAction::Failed { .. } => None,
    }
}

fn message_row(entry: Entry<'_>, self_id: UserId) -> MessageRow {
    match entry {
        Entry::Confirmed(message) => MessageRow {
            key: entry.key(),
            sender: message.sender.clone(),
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            created_at: message.created_at,
            edited: message.edited,
            own: message.sender.user_id == self_id,
            status: RowStatus::Confirmed,
        },
        Entry::Pending(pending) => MessageRow {
            key: entry.key(),
            sender: pending.sender.clone(),
            content: pending.draft.content.clone(),
            attachment: pending.draft.attachment.clone(),
            created_at: pending.created_at,
            edited: false,
            own: true,
            status: match &pending.state {
                PendingState::Sending => RowStatus::Sending,
                PendingState::Failed { reason } => RowStatus::Failed { reason: reason.clone() },
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        time::Instant,
    };

    use lessonhub_core::{MessageKind, Role, Sender, TypingUser};

    use super::*;
    use crate::{presence::TYPING_TIMEOUT, reconciler::MessageKey};

    struct ImmediateFuture;

    impl Future for ImmediateFuture {
        type Output = ();
        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
            Poll::Ready(())
        }
    }

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn wall_clock_millis(&self) -> u64 {
            10_000
        }

        fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
            ImmediateFuture
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0);
        }
    }

    fn auth() -> AuthContext {
        AuthContext {
            user_id: 1,
            display_name: "Ann".into(),
            role: Role::Student,
            token: Some("token".into()),
        }
    }

    fn session() -> ChatSession<TestEnv> {
        ChatSession::new(TestEnv, auth(), ReconnectPolicy::default())
    }

    fn message(chat_id: ChatId, id: MessageId, sender: u64, created_at: u64) -> Message {
        Message {
            id,
            chat_id,
            sender: Sender { user_id: sender, display_name: format!("user {sender}") },
            content: format!("message {id}"),
            attachment: None,
            created_at,
            updated_at: None,
            edited: false,
            read: false,
            kind: MessageKind::Text,
        }
    }

    fn history_request(actions: &[SessionAction]) -> RequestId {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::FetchHistory { request_id, .. } => Some(*request_id),
                _ => None,
            })
            .unwrap()
    }

    fn open_generation(actions: &[SessionAction]) -> Generation {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::OpenChannel { generation, .. } => Some(*generation),
                _ => None,
            })
            .unwrap()
    }

    /// Select a chat and confirm its channel.
    fn select_live(
        session: &mut ChatSession<TestEnv>,
        chat_id: ChatId,
        now: Instant,
    ) -> (RequestId, Generation) {
        let actions = session.select_chat(chat_id, now);
        let request = history_request(&actions);
        let generation = open_generation(&actions);
        let opened = SessionEvent::Channel { chat_id, generation, event: ChannelEvent::Opened };
        session.handle(opened, now);
        (request, generation)
    }

    fn push(chat_id: ChatId, generation: Generation, event: PushEvent) -> SessionEvent {
        SessionEvent::Channel { chat_id, generation, event: ChannelEvent::Push(event) }
    }

    #[test]
    fn select_issues_history_open_and_mark_read() {
        let mut session = session();
        let actions = session.select_chat(3, Instant::now());

        assert!(matches!(actions.as_slice(), [
            SessionAction::FetchHistory { chat_id: 3, limit: HISTORY_PAGE_SIZE, offset: 0, .. },
            SessionAction::OpenChannel { chat_id: 3, .. },
            SessionAction::MarkChatRead { chat_id: 3, .. },
        ]));
        assert_eq!(session.phase(), SessionPhase::Switching);
    }

    #[test]
    fn reselecting_same_chat_is_noop() {
        let mut session = session();
        let now = Instant::now();
        session.select_chat(3, now);
        assert!(session.select_chat(3, now).is_empty());
    }

    #[test]
    fn switching_waits_for_channel_and_minimum_display() {
        let mut session = session();
        let now = Instant::now();
        select_live(&mut session, 3, now);
        assert_eq!(session.phase(), SessionPhase::Switching);

        session.handle(SessionEvent::Tick, now + Duration::from_millis(299));
        assert_eq!(session.phase(), SessionPhase::Switching);
        session.handle(SessionEvent::Tick, now + MIN_SWITCH_DISPLAY);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn typing_expiry_follows_latest_timer() {
        let mut session = session();
        let now = Instant::now();
        let (_, generation) = select_live(&mut session, 3, now);
        let tutor = TypingUser { user_id: 2, display_name: "Bo".into() };

        session.handle(push(3, generation, PushEvent::Typing(tutor.clone())), now);
        let refreshed = now + Duration::from_secs(2);
        session.handle(push(3, generation, PushEvent::Typing(tutor)), refreshed);

        // The first timer fires but has been superseded by the refresh.
        session.handle(SessionEvent::Tick, now + TYPING_TIMEOUT);
        assert!(!session.typing.is_empty());
        assert_eq!(session.next_deadline(), Some(refreshed + TYPING_TIMEOUT));

        session.handle(SessionEvent::Tick, refreshed + TYPING_TIMEOUT);
        assert!(session.typing.is_empty());
        assert!(session.typing_timers.is_empty());
    }

    #[test]
    fn switch_cancels_history_and_purges_cache() {
        let mut session = session();
        let now = Instant::now();
        let (request, generation) = select_live(&mut session, 3, now);
        session.handle(push(3, generation, PushEvent::Message(message(3, 10, 2, 5))), now);
        assert_eq!(session.cache().len(3), 1);

        let actions = session.select_chat(4, now);
        assert_eq!(actions[0], SessionAction::CancelRequest { request_id: request });
        assert!(actions.contains(&SessionAction::CloseChannel { chat_id: 3, generation }));
        assert!(!session.cache().has_chat(3));

        let late = SessionEvent::HistoryLoaded {
            request_id: request,
            result: Ok(vec![message(3, 11, 2, 6)]),
        };
        session.handle(late, now);
        assert!(!session.cache().has_chat(3));
    }

    #[test]
    fn missing_token_fails_with_auth_banner() {
        let mut signed_out = auth();
        signed_out.token = None;
        let mut session = ChatSession::new(TestEnv, signed_out, ReconnectPolicy::default());
        let now = Instant::now();

        assert!(session.select_chat(3, now).is_empty());
        assert_eq!(session.phase(), SessionPhase::Error);
        assert_eq!(session.banner().map(|b| b.kind), Some(BannerKind::Auth));

        let actions = session.set_auth(auth(), now);
        assert_eq!(session.phase(), SessionPhase::Switching);
        assert!(session.banner().is_none());
        assert!(actions.iter().any(|a| matches!(a, SessionAction::OpenChannel { chat_id: 3, .. })));
    }

    #[test]
    fn invalid_draft_has_no_effect() {
        let mut session = session();
        let now = Instant::now();
        select_live(&mut session, 3, now);
        let in_flight = session.in_flight();

        let result = session.send_message(MessageDraft::text("   "), now);
        assert!(matches!(result, Err(SendError::Validation(_))));
        assert_eq!(session.in_flight(), in_flight);
        assert!(session.view(now).messages.is_empty());
    }

    #[test]
    fn send_without_selection_is_rejected() {
        let mut session = session();
        let result = session.send_message(MessageDraft::text("hi"), Instant::now());
        assert_eq!(result, Err(SendError::NoActiveChat));
    }

    #[test]
    fn failed_send_stays_visible_until_retried() {
        let mut session = session();
        let now = Instant::now();
        select_live(&mut session, 3, now);

        let actions = session.send_message(MessageDraft::text("hi"), now).unwrap();
        let Some(SessionAction::SendMessage { request_id, .. }) = actions.last().cloned() else {
            panic!("expected send, got {actions:?}");
        };
        let failed = SessionEvent::SendCompleted {
            request_id,
            result: Err(ApiError::Network("offline".into())),
        };
        session.handle(failed, now);

        let view = session.view(now);
        let MessageKey::Pending(local_id) = view.messages[0].key else {
            panic!("expected pending row");
        };
        assert!(matches!(view.messages[0].status, RowStatus::Failed { .. }));
        assert!(session.banner().is_none());

        let resend = session.retry_send(local_id).unwrap();
        assert!(matches!(resend.as_slice(), [SessionAction::SendMessage { .. }]));
        assert_eq!(session.view(now).messages[0].status, RowStatus::Sending);
    }

    #[test]
    fn only_author_can_edit() {
        let mut session = session();
        let now = Instant::now();
        let (request, _) = select_live(&mut session, 3, now);
        let page = vec![message(3, 10, 1, 5), message(3, 11, 2, 6)];
        session.handle(SessionEvent::HistoryLoaded { request_id: request, result: Ok(page) }, now);

        assert!(session.edit_message(10, "fixed".into()).is_ok());
        assert_eq!(
            session.edit_message(11, "nope".into()),
            Err(SendError::NotAuthor { message_id: 11 })
        );
        assert_eq!(
            session.delete_message(99),
            Err(SendError::UnknownMessage { chat_id: 3, message_id: 99 })
        );
    }

    #[test]
    fn short_history_page_exhausts_paging() {
        let mut session = session();
        let now = Instant::now();
        let (request, _) = select_live(&mut session, 3, now);
        assert!(session.load_older().is_empty());

        let page = vec![message(3, 10, 2, 5)];
        session.handle(SessionEvent::HistoryLoaded { request_id: request, result: Ok(page) }, now);
        assert!(session.view(now).history_exhausted);
        assert!(session.load_older().is_empty());
    }

    #[test]
    fn incoming_push_refreshes_chat_list_once() {
        let mut session = session();
        let now = Instant::now();
        let (_, generation) = select_live(&mut session, 3, now);

        let first = PushEvent::Message(message(3, 10, 2, 5));
        let first = session.handle(push(3, generation, first), now);
        assert!(matches!(first.as_slice(), [SessionAction::FetchChatList { .. }]));

        let second = PushEvent::Message(message(3, 11, 2, 6));
        let second = session.handle(push(3, generation, second), now);
        assert!(second.is_empty());
    }

    #[test]
    fn chat_list_failure_is_retryable() {
        let mut session = session();
        let now = Instant::now();
        let actions = session.refresh_chat_list();
        let [SessionAction::FetchChatList { request_id }] = actions.as_slice() else {
            panic!("expected chat list fetch");
        };
        let request_id = *request_id;
        let failed = SessionEvent::ChatListLoaded {
            request_id,
            result: Err(ApiError::Server { status: 503, message: "busy".into() }),
        };
        session.handle(failed, now);
        let banner = session.banner().map(|b| (b.kind, b.retryable));
        assert_eq!(banner, Some((BannerKind::ChatList, true)));

        let actions = session.retry(now);
        assert!(matches!(actions.as_slice(), [SessionAction::FetchChatList { .. }]));
        assert!(session.banner().is_none());
    }
}
