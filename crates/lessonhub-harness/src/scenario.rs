//! Step-by-step session driver for scenario tests.
//!
//! [`SessionHarness`] plays the runtime's part by hand: it feeds intents and
//! collaborator results into a [`ChatSession`] under virtual time, remembers
//! which channels and history requests are outstanding, and checks every
//! standard invariant after each step.

use std::{collections::HashMap, time::Duration};

use lessonhub_chat::{
    ChannelEvent, ChatSession, ChatView, Generation, LocalId, RequestId, SendError, SessionAction,
    SessionEvent, session::MIN_SWITCH_DISPLAY,
};
use lessonhub_core::{
    ApiError, AuthContext, Chat, ChatId, Environment, Message, MessageDraft, MessageId,
    MessageKind, PushEvent, ReconnectPolicy, Role, Sender, TypingUser, UserId,
};

use crate::{
    invariants::{InvariantRegistry, SessionSnapshot},
    sim_env::{SIM_EPOCH_MILLIS, SimEnv, SimInstant},
};

#[derive(Debug, Clone, Copy)]
struct HistoryRequest {
    request_id: RequestId,
    chat_id: ChatId,
    offset: usize,
}

/// Drives one session through scripted steps.
pub struct SessionHarness {
    env: SimEnv,
    session: ChatSession<SimEnv>,
    invariants: InvariantRegistry,
    actions: Vec<SessionAction>,
    channels: HashMap<ChatId, Generation>,
    history: Vec<HistoryRequest>,
    steps: usize,
}

impl SessionHarness {
    /// Harness for a signed-in user with the default reconnect policy.
    pub fn new(auth: AuthContext) -> Self {
        Self::with_env(SimEnv::default(), auth)
    }

    /// Harness on a specific environment.
    pub fn with_env(env: SimEnv, auth: AuthContext) -> Self {
        let session = ChatSession::new(env.clone(), auth, ReconnectPolicy::default());
        Self {
            env,
            session,
            invariants: InvariantRegistry::standard(),
            actions: Vec::new(),
            channels: HashMap::new(),
            history: Vec::new(),
            steps: 0,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> SimInstant {
        self.env.now()
    }

    /// The simulated environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// The session under test.
    pub fn session(&self) -> &ChatSession<SimEnv> {
        &self.session
    }

    /// Rendered view at the current time.
    pub fn view(&self) -> ChatView {
        self.session.view(self.now())
    }

    /// Actions emitted since the last call, oldest first.
    pub fn take_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.actions)
    }

    /// Generation of the channel the session last opened for `chat_id`.
    pub fn generation(&self, chat_id: ChatId) -> Option<Generation> {
        self.channels.get(&chat_id).copied()
    }

    /// Oldest outstanding history request for `chat_id`, as
    /// `(request_id, offset)`.
    pub fn history_request(&self, chat_id: ChatId) -> Option<(RequestId, usize)> {
        self.history
            .iter()
            .find(|r| r.chat_id == chat_id)
            .map(|r| (r.request_id, r.offset))
    }

    /// Select a chat.
    pub fn select(&mut self, chat_id: ChatId) -> Vec<SessionAction> {
        let actions = self.session.select_chat(chat_id, self.now());
        self.record(actions, "select")
    }

    /// Select a chat, report its channel open and let the switch settle.
    pub fn select_live(&mut self, chat_id: ChatId) -> Vec<SessionAction> {
        let mut actions = self.select(chat_id);
        actions.extend(self.open(chat_id));
        actions.extend(self.advance(MIN_SWITCH_DISPLAY));
        actions
    }

    /// Deselect the current chat.
    pub fn clear_selection(&mut self) -> Vec<SessionAction> {
        let actions = self.session.clear_selection();
        self.record(actions, "clear selection")
    }

    /// Press the banner's retry button.
    pub fn retry(&mut self) -> Vec<SessionAction> {
        let actions = self.session.retry(self.now());
        self.record(actions, "retry")
    }

    /// Replace the credentials.
    pub fn set_auth(&mut self, auth: AuthContext) -> Vec<SessionAction> {
        let actions = self.session.set_auth(auth, self.now());
        self.record(actions, "set auth")
    }

    /// Feed any event into the session.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        let actions = self.session.handle(event, self.now());
        self.record(actions, "handle")
    }

    /// Report the chat's current channel as open.
    pub fn open(&mut self, chat_id: ChatId) -> Vec<SessionAction> {
        self.channel_event(chat_id, ChannelEvent::Opened)
    }

    /// Report the chat's current channel as dropped.
    pub fn drop_channel(&mut self, chat_id: ChatId) -> Vec<SessionAction> {
        self.channel_event(chat_id, ChannelEvent::Closed { reason: "connection reset".into() })
    }

    /// Deliver a push event on the chat's current channel.
    pub fn push(&mut self, chat_id: ChatId, event: PushEvent) -> Vec<SessionAction> {
        self.channel_event(chat_id, ChannelEvent::Push(event))
    }

    /// Deliver a channel event tagged with an explicit generation.
    pub fn push_on(
        &mut self,
        chat_id: ChatId,
        generation: Generation,
        event: PushEvent,
    ) -> Vec<SessionAction> {
        let event = SessionEvent::Channel { chat_id, generation, event: ChannelEvent::Push(event) };
        self.handle(event)
    }

    /// Answer the oldest outstanding history request of a chat.
    pub fn complete_history(
        &mut self,
        chat_id: ChatId,
        result: Result<Vec<Message>, ApiError>,
    ) -> Vec<SessionAction> {
        let Some(position) = self.history.iter().position(|r| r.chat_id == chat_id) else {
            return Vec::new();
        };
        let request = self.history.remove(position);
        self.handle(SessionEvent::HistoryLoaded { request_id: request.request_id, result })
    }

    /// Answer a request with a chat list.
    pub fn complete_chat_list(
        &mut self,
        request_id: RequestId,
        result: Result<Vec<Chat>, ApiError>,
    ) -> Vec<SessionAction> {
        self.handle(SessionEvent::ChatListLoaded { request_id, result })
    }

    /// Send a text message.
    pub fn send(&mut self, text: &str) -> Result<Vec<SessionAction>, SendError> {
        let actions = self.session.send_message(MessageDraft::text(text), self.now())?;
        Ok(self.record(actions, "send"))
    }

    /// Answer a send request.
    pub fn complete_send(
        &mut self,
        request_id: RequestId,
        result: Result<Message, ApiError>,
    ) -> Vec<SessionAction> {
        self.handle(SessionEvent::SendCompleted { request_id, result })
    }

    /// Resend a failed message.
    pub fn retry_send(&mut self, local_id: LocalId) -> Result<Vec<SessionAction>, SendError> {
        let actions = self.session.retry_send(local_id)?;
        Ok(self.record(actions, "retry send"))
    }

    /// Reload the chat list.
    pub fn refresh_chat_list(&mut self) -> Vec<SessionAction> {
        let actions = self.session.refresh_chat_list();
        self.record(actions, "refresh chat list")
    }

    /// The local user typed a key.
    pub fn type_key(&mut self) -> Vec<SessionAction> {
        let actions = self.session.local_typing(self.now());
        self.record(actions, "typing")
    }

    /// Request the next older history page.
    pub fn load_older(&mut self) -> Vec<SessionAction> {
        let actions = self.session.load_older();
        self.record(actions, "load older")
    }

    /// Move virtual time forward and deliver a tick.
    pub fn advance(&mut self, duration: Duration) -> Vec<SessionAction> {
        self.env.advance(duration);
        self.handle(SessionEvent::Tick)
    }

    /// Check every invariant, panicking on violation.
    pub fn check(&self, context: &str) {
        let snapshot = SessionSnapshot::from_session(&self.session, self.now());
        self.invariants.assert_all(&snapshot, context);
    }

    fn channel_event(&mut self, chat_id: ChatId, event: ChannelEvent) -> Vec<SessionAction> {
        let Some(generation) = self.generation(chat_id) else {
            return Vec::new();
        };
        self.handle(SessionEvent::Channel { chat_id, generation, event })
    }

    fn record(&mut self, actions: Vec<SessionAction>, step: &str) -> Vec<SessionAction> {
        self.steps += 1;
        for action in &actions {
            match *action {
                SessionAction::OpenChannel { chat_id, generation } => {
                    self.channels.insert(chat_id, generation);
                },
                SessionAction::CloseChannel { chat_id, generation } => {
                    if self.channels.get(&chat_id) == Some(&generation) {
                        self.channels.remove(&chat_id);
                    }
                },
                SessionAction::FetchHistory { request_id, chat_id, offset, .. } => {
                    self.history.push(HistoryRequest { request_id, chat_id, offset });
                },
                SessionAction::CancelRequest { request_id } => {
                    self.history.retain(|r| r.request_id != request_id);
                },
                _ => {},
            }
        }

        tracing::trace!(step, n = self.steps, actions = actions.len(), "harness step");
        self.check(&format!("after step {} ({step})", self.steps));
        self.actions.extend(actions.iter().cloned());
        actions
    }
}

/// Credentials for a signed-in test user.
pub fn signed_in(user_id: UserId, display_name: &str) -> AuthContext {
    AuthContext {
        user_id,
        display_name: display_name.into(),
        role: Role::Student,
        token: Some(format!("token-{user_id}")),
    }
}

/// Server message with the given timestamp offset from the simulation epoch.
pub fn message(
    chat_id: ChatId,
    id: MessageId,
    sender: UserId,
    content: &str,
    at_ms: u64,
) -> Message {
    Message {
        id,
        chat_id,
        sender: Sender { user_id: sender, display_name: format!("user-{sender}") },
        content: content.into(),
        attachment: None,
        created_at: SIM_EPOCH_MILLIS + at_ms,
        updated_at: None,
        edited: false,
        read: false,
        kind: MessageKind::Text,
    }
}

/// Typing user with a derived display name.
pub fn typing_user(user_id: UserId) -> TypingUser {
    TypingUser { user_id, display_name: format!("user-{user_id}") }
}
