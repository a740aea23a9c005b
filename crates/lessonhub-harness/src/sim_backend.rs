//! In-memory chat server implementing both collaborator traits.
//!
//! Stores chats and messages, fans new messages out to every open channel of
//! the chat (the sender's own channel included, like the real server), and
//! exposes fault knobs for rejected credentials, slow history, failed sends
//! and dropped channels.
//!
//! State sits behind a std mutex that is never held across an await.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use lessonhub_app::{ChannelEndpoint, ChannelHandle, ChatApi, PushTransport};
use lessonhub_core::{
    ApiError, Attachment, AuthContext, Chat, ChatId, Message, MessageId, MessageKind,
    OutboundEvent, Participant, PushEvent, Role, Sender, TransportError, TypingUser, UserId,
};

use crate::sim_env::SIM_EPOCH_MILLIS;

const CHANNEL_BUFFER: usize = 64;

struct Subscriber {
    chat_id: ChatId,
    endpoint: ChannelEndpoint,
}

#[derive(Default)]
struct Faults {
    reject_auth: bool,
    failing_opens: u32,
    failing_sends: u32,
    failing_history: u32,
    failing_chat_lists: u32,
    history_delay: Duration,
}

struct BackendState {
    user: Sender,
    chats: BTreeMap<ChatId, Chat>,
    messages: BTreeMap<ChatId, Vec<Message>>,
    subscribers: Vec<Subscriber>,
    next_message_id: MessageId,
    clock_ms: u64,
    faults: Faults,
    mark_read_calls: Vec<ChatId>,
    history_calls: Vec<(ChatId, usize)>,
    channel_opens: Vec<ChatId>,
}

impl BackendState {
    fn tick_clock(&mut self) -> u64 {
        self.clock_ms += 1;
        self.clock_ms
    }

    fn store(
        &mut self,
        chat_id: ChatId,
        sender: Sender,
        content: String,
        attachment: Option<Attachment>,
    ) -> Message {
        let id = self.next_message_id;
        self.next_message_id += 1;
        let created_at = self.tick_clock();
        let message = Message {
            id,
            chat_id,
            sender,
            content,
            attachment,
            created_at,
            updated_at: None,
            edited: false,
            read: false,
            kind: MessageKind::Text,
        };

        if let Some(chat) = self.chats.get_mut(&chat_id) {
            chat.last_message = Some(message.preview());
            if message.sender.user_id != self.user.user_id {
                chat.unread_count += 1;
            }
        }
        self.messages.entry(chat_id).or_default().push(message.clone());
        message
    }

    fn find_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.messages.values_mut().flatten().find(|m| m.id == message_id)
    }

    fn broadcast(&mut self, chat_id: ChatId, event: &PushEvent) {
        self.subscribers.retain(|s| !s.endpoint.is_closed());
        for subscriber in self.subscribers.iter().filter(|s| s.chat_id == chat_id) {
            if subscriber.endpoint.inbound.try_send(Ok(event.clone())).is_err() {
                tracing::warn!(chat_id, "simulated channel buffer full");
            }
        }
    }
}

/// Shared in-memory backend.
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<Mutex<BackendState>>,
}

impl SimBackend {
    /// Empty backend answering on behalf of `user`.
    pub fn new(user: Sender) -> Self {
        let state = BackendState {
            user,
            chats: BTreeMap::new(),
            messages: BTreeMap::new(),
            subscribers: Vec::new(),
            next_message_id: 1,
            clock_ms: SIM_EPOCH_MILLIS,
            faults: Faults::default(),
            mark_read_calls: Vec::new(),
            history_calls: Vec::new(),
            channel_opens: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Backend with a few tutoring chats and some history, for demos.
    pub fn demo(user: &AuthContext) -> Self {
        let backend = Self::new(user.sender());
        let me = participant(user.user_id, &user.display_name, user.role);
        let tutor = participant(100, "Ms. Rivera", Role::Tutor);
        let parent = participant(101, "Sam's dad", Role::Parent);
        let peer = participant(102, "Noor", Role::Student);

        backend.add_chat(1, None, Some("Algebra"), vec![me.clone(), tutor.clone()]);
        backend.add_chat(2, Some("Physics study group"), Some("Physics"), vec![
            me.clone(),
            tutor.clone(),
            peer.clone(),
        ]);
        backend.add_chat(3, None, None, vec![me, parent.clone()]);

        let tutor = Sender { user_id: tutor.user_id, display_name: tutor.display_name };
        let peer = Sender { user_id: peer.user_id, display_name: peer.display_name };
        let parent = Sender { user_id: parent.user_id, display_name: parent.display_name };
        backend.inject_message(1, tutor.clone(), "Did you finish the quadratic worksheet?");
        backend.inject_message(1, tutor.clone(), "Question 7 is the tricky one.");
        backend.inject_message(2, peer, "Anyone got the answer for the pendulum lab?");
        backend.inject_message(2, tutor, "Remember the small-angle approximation.");
        backend.inject_message(3, parent, "Can we move Thursday's lesson to 5pm?");
        backend
    }

    /// Register a chat.
    pub fn add_chat(
        &self,
        chat_id: ChatId,
        name: Option<&str>,
        subject: Option<&str>,
        participants: Vec<Participant>,
    ) {
        let chat = Chat {
            id: chat_id,
            name: name.map(Into::into),
            subject: subject.map(Into::into),
            participants,
            unread_count: 0,
            last_message: None,
        };
        self.state().chats.insert(chat_id, chat);
    }

    /// Store a message from another participant and push it to open channels.
    pub fn inject_message(&self, chat_id: ChatId, sender: Sender, content: &str) -> Message {
        let mut state = self.state();
        let message = state.store(chat_id, sender, content.into(), None);
        state.broadcast(chat_id, &PushEvent::Message(message.clone()));
        message
    }

    /// Push an arbitrary event to every open channel of a chat.
    pub fn push(&self, chat_id: ChatId, event: PushEvent) {
        self.state().broadcast(chat_id, &event);
    }

    /// Push a typing event.
    pub fn push_typing(&self, chat_id: ChatId, user: TypingUser) {
        self.push(chat_id, PushEvent::Typing(user));
    }

    /// Drop every open channel of a chat, as a network failure would.
    pub fn force_close(&self, chat_id: ChatId) {
        self.state().subscribers.retain(|s| s.chat_id != chat_id);
    }

    /// Reject the credentials of every open channel of a chat.
    pub fn revoke(&self, chat_id: ChatId) {
        let mut state = self.state();
        for subscriber in state.subscribers.iter().filter(|s| s.chat_id == chat_id) {
            let rejected = Err(TransportError::Unauthorized("session expired".into()));
            let _ = subscriber.endpoint.inbound.try_send(rejected);
        }
        state.subscribers.retain(|s| s.chat_id != chat_id);
    }

    /// Reject all future channel opens.
    pub fn set_reject_auth(&self, reject: bool) {
        self.state().faults.reject_auth = reject;
    }

    /// Fail the next `count` channel opens with a connection error.
    pub fn fail_opens(&self, count: u32) {
        self.state().faults.failing_opens = count;
    }

    /// Fail the next `count` sends with a network error.
    pub fn fail_sends(&self, count: u32) {
        self.state().faults.failing_sends = count;
    }

    /// Fail the next `count` history loads with a server error.
    pub fn fail_history(&self, count: u32) {
        self.state().faults.failing_history = count;
    }

    /// Fail the next `count` chat-list loads with a server error.
    pub fn fail_chat_lists(&self, count: u32) {
        self.state().faults.failing_chat_lists = count;
    }

    /// Delay every history response.
    pub fn set_history_delay(&self, delay: Duration) {
        self.state().faults.history_delay = delay;
    }

    /// Open channels per chat.
    pub fn subscriber_count(&self, chat_id: ChatId) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.endpoint.is_closed());
        state.subscribers.iter().filter(|s| s.chat_id == chat_id).count()
    }

    /// Events the client sent over a chat's channels, drained.
    pub fn client_events(&self, chat_id: ChatId) -> Vec<OutboundEvent> {
        let mut state = self.state();
        let mut events = Vec::new();
        for subscriber in state.subscribers.iter_mut().filter(|s| s.chat_id == chat_id) {
            while let Ok(event) = subscriber.endpoint.outbound.try_recv() {
                events.push(event);
            }
        }
        events
    }

    /// Chats passed to `mark_chat_read`, in call order.
    pub fn mark_read_calls(&self) -> Vec<ChatId> {
        self.state().mark_read_calls.clone()
    }

    /// `(chat_id, offset)` of every history request, in call order.
    pub fn history_calls(&self) -> Vec<(ChatId, usize)> {
        self.state().history_calls.clone()
    }

    /// Chats of every successful channel open, in call order.
    pub fn channel_opens(&self) -> Vec<ChatId> {
        self.state().channel_opens.clone()
    }

    /// Stored messages of a chat, oldest first.
    pub fn messages(&self, chat_id: ChatId) -> Vec<Message> {
        self.state().messages.get(&chat_id).cloned().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

fn unavailable() -> ApiError {
    ApiError::Server { status: 503, message: "simulated outage".into() }
}

impl ChatApi for SimBackend {
    async fn fetch_chat_list(&self) -> Result<Vec<Chat>, ApiError> {
        let mut state = self.state();
        if take_fault(&mut state.faults.failing_chat_lists) {
            return Err(unavailable());
        }
        Ok(state.chats.values().cloned().collect())
    }

    async fn fetch_message_history(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let delay = self.state().faults.history_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.history_calls.push((chat_id, offset));
        if take_fault(&mut state.faults.failing_history) {
            return Err(unavailable());
        }
        if !state.chats.contains_key(&chat_id) {
            return Err(ApiError::NotFound(format!("chat {chat_id}")));
        }

        let page: Vec<Message> = state
            .messages
            .get(&chat_id)
            .map(|all| all.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(page)
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        content: String,
        attachment: Option<Attachment>,
    ) -> Result<Message, ApiError> {
        let mut state = self.state();
        if take_fault(&mut state.faults.failing_sends) {
            return Err(ApiError::Network("simulated connection reset".into()));
        }
        if !state.chats.contains_key(&chat_id) {
            return Err(ApiError::NotFound(format!("chat {chat_id}")));
        }

        let sender = state.user.clone();
        let message = state.store(chat_id, sender, content, attachment);
        state.broadcast(chat_id, &PushEvent::Message(message.clone()));
        Ok(message)
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: String,
    ) -> Result<Message, ApiError> {
        let mut state = self.state();
        let user_id = state.user.user_id;
        let updated_at = state.tick_clock();
        let Some(message) = state.find_mut(message_id) else {
            return Err(ApiError::NotFound(format!("message {message_id}")));
        };
        if message.sender.user_id != user_id {
            return Err(ApiError::Server { status: 403, message: "not the author".into() });
        }

        message.content = content;
        message.updated_at = Some(updated_at);
        message.edited = true;
        let message = message.clone();
        state.broadcast(message.chat_id, &PushEvent::MessageEdited(message.clone()));
        Ok(message)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<(), ApiError> {
        let mut state = self.state();
        let user_id = state.user.user_id;
        let found = state.messages.iter().find_map(|(&chat_id, messages)| {
            messages.iter().find(|m| m.id == message_id).map(|m| (chat_id, m.sender.user_id))
        });
        let Some((chat_id, author)) = found else {
            return Err(ApiError::NotFound(format!("message {message_id}")));
        };
        if author != user_id {
            return Err(ApiError::Server { status: 403, message: "not the author".into() });
        }

        if let Some(messages) = state.messages.get_mut(&chat_id) {
            messages.retain(|m| m.id != message_id);
        }
        state.broadcast(chat_id, &PushEvent::MessageDeleted { message_id });
        Ok(())
    }

    async fn mark_chat_read(&self, chat_id: ChatId) -> Result<(), ApiError> {
        let mut state = self.state();
        state.mark_read_calls.push(chat_id);
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            chat.unread_count = 0;
        }
        Ok(())
    }
}

impl PushTransport for SimBackend {
    async fn open_channel(
        &self,
        chat_id: ChatId,
        auth: &AuthContext,
    ) -> Result<ChannelHandle, TransportError> {
        let mut state = self.state();
        if state.faults.reject_auth || !auth.is_authenticated() {
            return Err(TransportError::Unauthorized("invalid token".into()));
        }
        if take_fault(&mut state.faults.failing_opens) {
            return Err(TransportError::Connection("simulated refusal".into()));
        }
        if !state.chats.contains_key(&chat_id) {
            return Err(TransportError::Connection(format!("no room {chat_id}")));
        }

        let (handle, endpoint) = ChannelHandle::pair(CHANNEL_BUFFER);
        state.subscribers.push(Subscriber { chat_id, endpoint });
        state.channel_opens.push(chat_id);
        Ok(handle)
    }
}

/// Participant helper for tests and demos.
pub fn participant(user_id: UserId, display_name: &str, role: Role) -> Participant {
    Participant { user_id, display_name: display_name.into(), role }
}
