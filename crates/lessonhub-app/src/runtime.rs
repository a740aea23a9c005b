//! Async runtime for the chat session.
//!
//! The [`Runtime`] owns a [`ChatSession`] and executes its actions:
//!
//! - collaborator requests run on spawned tasks, tracked by request ID so a
//!   cancelled request is aborted
//! - each push channel runs on its own task, tagged with the channel's
//!   generation, and forwards transport events back to the loop
//! - after every step the view snapshot is published on a `watch` channel
//!
//! All results funnel into one event queue, so the session sees one event at a
//! time and needs no locking.

use std::{collections::HashMap, future::Future, time::Duration};

use lessonhub_chat::{
    ChannelEvent, ChatSession, ChatView, Generation, LocalId, RequestId, SendError, SessionAction,
    SessionEvent,
};
use lessonhub_core::{
    AuthContext, ChatId, Environment, MessageDraft, MessageId, OutboundEvent, PushEvent,
    ReconnectPolicy, TransportError, validation,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::AbortHandle,
};

use crate::{
    backend::{ChatApi, PushTransport},
    error::RuntimeError,
};

/// Runtime tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Interval between session ticks (typing expiry, reconnects, settling).
    pub tick_interval: Duration,
    /// Capacity of the command queue.
    pub command_buffer: usize,
    /// Capacity of each channel's outbound queue.
    pub outbound_buffer: usize,
    /// Push channel reconnection backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            command_buffer: 64,
            outbound_buffer: 16,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), SendError>>;

/// User intents sent to the runtime.
#[derive(Debug)]
pub enum AppCommand {
    /// Switch to a chat.
    SelectChat(ChatId),
    /// Deselect the current chat.
    ClearSelection,
    /// Retry whatever the error banner offers.
    Retry,
    /// Hide the error banner.
    DismissError,
    /// Reload the chat list.
    RefreshChatList,
    /// Load older history.
    LoadOlder,
    /// The local user is typing.
    Typing,
    /// Replace the credentials.
    SetAuth(AuthContext),
    /// Send a message.
    Send(MessageDraft, Reply),
    /// Resend a failed message.
    RetrySend(LocalId, Reply),
    /// Drop a failed message.
    DiscardFailed(LocalId, Reply),
    /// Edit an own message.
    Edit(MessageId, String, Reply),
    /// Delete an own message.
    Delete(MessageId, Reply),
    /// Stop the runtime.
    Shutdown,
}

struct ChannelTask {
    outbound: mpsc::Sender<OutboundEvent>,
    task: AbortHandle,
}

enum Step {
    Command(Option<AppCommand>),
    Event(SessionEvent),
    Timer,
}

/// Event loop executing a [`ChatSession`] against real collaborators.
pub struct Runtime<A, T, E>
where
    A: ChatApi,
    T: PushTransport,
    E: Environment,
{
    session: ChatSession<E>,
    env: E,
    api: A,
    transport: T,
    config: RuntimeConfig,
    commands: mpsc::Receiver<AppCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    requests: HashMap<RequestId, AbortHandle>,
    channels: HashMap<(ChatId, Generation), ChannelTask>,
    view: watch::Sender<ChatView>,
    next_tick: E::Instant,
}

impl<A, T, E> Runtime<A, T, E>
where
    A: ChatApi,
    T: PushTransport,
    E: Environment,
{
    /// Create a runtime and the handle used to drive it.
    pub fn new(
        api: A,
        transport: T,
        env: E,
        auth: AuthContext,
        config: RuntimeConfig,
    ) -> (Self, RuntimeHandle) {
        let mut session = ChatSession::new(env.clone(), auth, config.reconnect.clone());
        let (commands_tx, commands) = mpsc::channel(config.command_buffer);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view, view_rx) = watch::channel(ChatView::default());
        let (connected_tx, connected) = watch::channel(false);

        session.on_connection_change(move |chat_id, live| {
            tracing::debug!(chat_id, connected = live, "connection changed");
            connected_tx.send_replace(live);
        });

        let next_tick = env.now();
        let runtime = Self {
            session,
            env,
            api,
            transport,
            config,
            commands,
            events_tx,
            events_rx,
            requests: HashMap::new(),
            channels: HashMap::new(),
            view,
            next_tick,
        };
        let handle = RuntimeHandle { commands: commands_tx, view: view_rx, connected };
        (runtime, handle)
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(user_id = self.session.auth().user_id, "chat runtime starting");
        let actions = self.session.refresh_chat_list();
        self.execute(actions);
        self.publish();

        loop {
            let now = self.env.now();
            let wait = if self.next_tick > now { self.next_tick - now } else { Duration::ZERO };

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                Some(event) = self.events_rx.recv() => Step::Event(event),
                () = self.env.sleep(wait) => Step::Timer,
            };

            match step {
                Step::Command(None | Some(AppCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Event(event) => {
                    if let Some(request_id) = event.request_id() {
                        self.requests.remove(&request_id);
                    }
                    if let SessionEvent::Channel {
                        chat_id,
                        generation,
                        event: ChannelEvent::Closed { .. } | ChannelEvent::AuthRejected { .. },
                    } = &event
                    {
                        self.channels.remove(&(*chat_id, *generation));
                    }
                    let actions = self.session.handle(event, self.env.now());
                    self.execute(actions);
                },
                Step::Timer => {},
            }

            let now = self.env.now();
            if now >= self.next_tick {
                let actions = self.session.handle(SessionEvent::Tick, now);
                self.execute(actions);
                self.next_tick = now + self.config.tick_interval;
            }
            self.publish();
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: AppCommand) {
        let now = self.env.now();
        let actions = match command {
            AppCommand::SelectChat(chat_id) => self.session.select_chat(chat_id, now),
            AppCommand::ClearSelection => self.session.clear_selection(),
            AppCommand::Retry => self.session.retry(now),
            AppCommand::DismissError => {
                self.session.dismiss_error();
                Vec::new()
            },
            AppCommand::RefreshChatList => self.session.refresh_chat_list(),
            AppCommand::LoadOlder => self.session.load_older(),
            AppCommand::Typing => self.session.local_typing(now),
            AppCommand::SetAuth(auth) => self.session.set_auth(auth, now),
            AppCommand::Send(draft, reply) => answer(reply, self.session.send_message(draft, now)),
            AppCommand::RetrySend(local_id, reply) => {
                answer(reply, self.session.retry_send(local_id))
            },
            AppCommand::DiscardFailed(local_id, reply) => {
                answer(reply, self.session.discard_failed(local_id).map(|()| Vec::new()))
            },
            AppCommand::Edit(message_id, content, reply) => {
                answer(reply, self.session.edit_message(message_id, content))
            },
            AppCommand::Delete(message_id, reply) => {
                answer(reply, self.session.delete_message(message_id))
            },
            AppCommand::Shutdown => Vec::new(),
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::FetchChatList { request_id } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result = api.fetch_chat_list().await;
                        SessionEvent::ChatListLoaded { request_id, result }
                    });
                },
                SessionAction::FetchHistory { request_id, chat_id, limit, offset } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result = api.fetch_message_history(chat_id, limit, offset).await;
                        SessionEvent::HistoryLoaded { request_id, result }
                    });
                },
                SessionAction::CancelRequest { request_id } => {
                    if let Some(task) = self.requests.remove(&request_id) {
                        tracing::debug!(request_id, "aborting request");
                        task.abort();
                    }
                },
                SessionAction::OpenChannel { chat_id, generation } => {
                    self.open_channel(chat_id, generation);
                },
                SessionAction::CloseChannel { chat_id, generation } => {
                    // Dropping the sender lets queued events drain before the
                    // channel task closes the transport.
                    if self.channels.remove(&(chat_id, generation)).is_some() {
                        tracing::debug!(chat_id, generation, "closing channel");
                    }
                },
                SessionAction::SendChannelEvent { chat_id, generation, event } => {
                    if let Some(channel) = self.channels.get(&(chat_id, generation))
                        && channel.outbound.try_send(event).is_err()
                    {
                        tracing::debug!(chat_id, generation, ?event, "outbound queue full");
                    }
                },
                SessionAction::SendMessage { request_id, chat_id, draft } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result =
                            api.send_message(chat_id, draft.content, draft.attachment).await;
                        SessionEvent::SendCompleted { request_id, result }
                    });
                },
                SessionAction::EditMessage { request_id, message_id, content } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result = api.edit_message(message_id, content).await;
                        SessionEvent::EditCompleted { request_id, result }
                    });
                },
                SessionAction::DeleteMessage { request_id, message_id } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result = api.delete_message(message_id).await;
                        SessionEvent::DeleteCompleted { request_id, result }
                    });
                },
                SessionAction::MarkChatRead { request_id, chat_id } => {
                    let api = self.api.clone();
                    self.spawn_request(request_id, async move {
                        let result = api.mark_chat_read(chat_id).await;
                        SessionEvent::MarkReadCompleted { request_id, result }
                    });
                },
            }
        }
    }

    fn spawn_request<F>(&mut self, request_id: RequestId, request: F)
    where
        F: Future<Output = SessionEvent> + Send + 'static,
    {
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let _ = events.send(request.await);
        });
        self.requests.insert(request_id, task.abort_handle());
    }

    fn open_channel(&mut self, chat_id: ChatId, generation: Generation) {
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let task = tokio::spawn(run_channel(
            self.transport.clone(),
            self.session.auth().clone(),
            chat_id,
            generation,
            outbound_rx,
            self.events_tx.clone(),
        ));
        tracing::debug!(chat_id, generation, "opening channel");
        let entry = ChannelTask { outbound, task: task.abort_handle() };
        self.channels.insert((chat_id, generation), entry);
    }

    fn publish(&self) {
        let view = self.session.view(self.env.now());
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn shutdown(&mut self) {
        tracing::info!(
            requests = self.requests.len(),
            channels = self.channels.len(),
            "chat runtime stopping"
        );
        for (_, task) in self.requests.drain() {
            task.abort();
        }
        for (_, channel) in self.channels.drain() {
            channel.task.abort();
        }
    }
}

fn answer(reply: Reply, result: Result<Vec<SessionAction>, SendError>) -> Vec<SessionAction> {
    match result {
        Ok(actions) => {
            let _ = reply.send(Ok(()));
            actions
        },
        Err(error) => {
            let _ = reply.send(Err(error));
            Vec::new()
        },
    }
}

enum ChannelStep {
    Inbound(Option<Result<PushEvent, TransportError>>),
    Outbound(Option<OutboundEvent>),
}

/// Drive one push channel until it closes or the runtime drops it.
async fn run_channel<T: PushTransport>(
    transport: T,
    auth: AuthContext,
    chat_id: ChatId,
    generation: Generation,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let emit = |event: ChannelEvent| {
        let _ = events.send(SessionEvent::Channel { chat_id, generation, event });
    };
    let closed = |error: TransportError| {
        if error.is_auth() {
            ChannelEvent::AuthRejected { reason: error.to_string() }
        } else {
            ChannelEvent::Closed { reason: error.to_string() }
        }
    };

    let mut handle = match transport.open_channel(chat_id, &auth).await {
        Ok(handle) => handle,
        Err(error) => {
            tracing::debug!(chat_id, generation, %error, "channel open failed");
            emit(closed(error));
            return;
        },
    };
    emit(ChannelEvent::Opened);

    loop {
        let step = tokio::select! {
            item = handle.recv() => ChannelStep::Inbound(item),
            event = outbound.recv() => ChannelStep::Outbound(event),
        };

        match step {
            ChannelStep::Inbound(Some(Ok(event))) => emit(ChannelEvent::Push(event)),
            ChannelStep::Inbound(Some(Err(error))) => {
                emit(closed(error));
                break;
            },
            ChannelStep::Inbound(None) => {
                emit(ChannelEvent::Closed { reason: "stream ended".into() });
                break;
            },
            ChannelStep::Outbound(Some(event)) => {
                if let Err(error) = handle.send(event).await {
                    emit(closed(error));
                    break;
                }
            },
            ChannelStep::Outbound(None) => {
                handle.close();
                break;
            },
        }
    }
}

/// Cloneable handle to a running [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<AppCommand>,
    view: watch::Receiver<ChatView>,
    connected: watch::Receiver<bool>,
}

impl RuntimeHandle {
    /// Latest published view.
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Receiver tracking the selected channel's liveness.
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Switch to a chat.
    pub async fn select_chat(&self, chat_id: ChatId) -> Result<(), RuntimeError> {
        self.command(AppCommand::SelectChat(chat_id)).await
    }

    /// Deselect the current chat.
    pub async fn clear_selection(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::ClearSelection).await
    }

    /// Retry whatever the error banner offers.
    pub async fn retry(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::Retry).await
    }

    /// Hide the error banner.
    pub async fn dismiss_error(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::DismissError).await
    }

    /// Reload the chat list.
    pub async fn refresh_chat_list(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::RefreshChatList).await
    }

    /// Load older history of the selected chat.
    pub async fn load_older(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::LoadOlder).await
    }

    /// Report a keystroke in the composer.
    pub async fn typing(&self) -> Result<(), RuntimeError> {
        self.command(AppCommand::Typing).await
    }

    /// Replace the credentials after re-authentication.
    pub async fn set_auth(&self, auth: AuthContext) -> Result<(), RuntimeError> {
        self.command(AppCommand::SetAuth(auth)).await
    }

    /// Send a message to the selected chat.
    ///
    /// Invalid drafts are rejected without reaching the runtime.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<(), RuntimeError> {
        validation::validate_draft(&draft).map_err(SendError::from)?;
        self.request(|reply| AppCommand::Send(draft, reply)).await
    }

    /// Resend a failed message.
    pub async fn retry_send(&self, local_id: LocalId) -> Result<(), RuntimeError> {
        self.request(|reply| AppCommand::RetrySend(local_id, reply)).await
    }

    /// Drop a failed message.
    pub async fn discard_failed(&self, local_id: LocalId) -> Result<(), RuntimeError> {
        self.request(|reply| AppCommand::DiscardFailed(local_id, reply)).await
    }

    /// Edit an own message.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: String,
    ) -> Result<(), RuntimeError> {
        self.request(|reply| AppCommand::Edit(message_id, content, reply)).await
    }

    /// Delete an own message.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), RuntimeError> {
        self.request(|reply| AppCommand::Delete(message_id, reply)).await
    }

    /// Stop the runtime.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(AppCommand::Shutdown).await;
    }

    async fn command(&self, command: AppCommand) -> Result<(), RuntimeError> {
        self.commands.send(command).await.map_err(|_| RuntimeError::Stopped)
    }

    async fn request(&self, build: impl FnOnce(Reply) -> AppCommand) -> Result<(), RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply)).await?;
        response.await.map_err(|_| RuntimeError::Stopped)?.map_err(RuntimeError::from)
    }
}
