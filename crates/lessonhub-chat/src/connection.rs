//! Push channel connection manager.
//!
//! Owns the lifecycle of one push channel per chat room: connect, disconnect,
//! automatic reconnection with backoff, liveness reporting, and the debounced
//! local typing broadcast.
//!
//! Uses the action pattern: methods take time as input and return
//! [`ConnectionAction`]s for the runtime to execute. The manager never
//! touches the network itself.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect ┌────────────┐  Opened   ┌───────────┐
//! │ Disconnected │────────>│ Connecting │──────────>│ Connected │
//! └──────────────┘         └────────────┘           └───────────┘
//!                                │ Closed                │ Closed
//!                                ↓                       ↓
//!                          ┌──────────────┐  Opened  ┌───────────┐
//!                          │ Reconnecting │─────────>│ Connected │
//!                          └──────────────┘          └───────────┘
//!
//!   any state ──AuthRejected──> Failed (no retry)
//! ```
//!
//! Every open attempt gets a fresh [`Generation`]. Events tagged with an older
//! generation, or for a room that was disconnected, are dropped.

use std::{collections::BTreeMap, time::Duration};

use lessonhub_core::{AuthContext, ChatId, Environment, OutboundEvent, PushEvent, ReconnectPolicy};

use crate::error::ConnectionError;

/// How long the local "is typing" broadcast stays armed.
pub const TYPING_BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Open-attempt counter distinguishing successive channels of one room.
pub type Generation = u64;

/// Liveness state of one room's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No channel.
    #[default]
    Disconnected,
    /// First open attempt in progress.
    Connecting,
    /// Channel confirmed live.
    Connected,
    /// Channel dropped; reopen scheduled or in progress.
    Reconnecting,
    /// Credentials rejected; no automatic retry.
    Failed,
}

/// Transport-level events reported by the runtime for an open attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel established.
    Opened,
    /// Push event received.
    Push(PushEvent),
    /// Channel closed unexpectedly or failed to open.
    Closed {
        /// Transport-provided reason
        reason: String,
    },
    /// Server rejected the credentials.
    AuthRejected {
        /// Server-provided reason
        reason: String,
    },
}

/// Actions returned by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a push channel for the room.
    Open {
        /// Room to subscribe to
        chat_id: ChatId,
        /// Tag to attach to every event of this attempt
        generation: Generation,
    },
    /// Close the room's channel.
    Close {
        /// Room to unsubscribe from
        chat_id: ChatId,
        /// Attempt being closed
        generation: Generation,
    },
    /// Send an event over the room's channel.
    Send {
        /// Target room
        chat_id: ChatId,
        /// Attempt to send on
        generation: Generation,
        /// Event to send
        event: OutboundEvent,
    },
    /// Dispatch a push event to the room's handlers.
    Deliver {
        /// Source room
        chat_id: ChatId,
        /// Received event
        event: PushEvent,
    },
    /// Fatal failure for the room.
    Failed {
        /// Failure reported to the user
        error: ConnectionError,
    },
}

/// Handle returned by [`ConnectionManager::on_connection_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(ChatId, bool) + Send>;

#[derive(Debug, Clone)]
struct Channel<I> {
    state: ChannelState,
    generation: Generation,
    /// Consecutive failed attempts since the last successful open.
    attempt: u32,
    retry_at: Option<I>,
    /// Deadline of the armed typing broadcast. `None` if not typing.
    typing_until: Option<I>,
    /// When the last typing event went out.
    typing_sent_at: Option<I>,
}

impl<I> Channel<I> {
    fn new(generation: Generation) -> Self {
        Self {
            state: ChannelState::Connecting,
            generation,
            attempt: 0,
            retry_at: None,
            typing_until: None,
            typing_sent_at: None,
        }
    }

    fn clear_typing(&mut self) -> bool {
        self.typing_sent_at = None;
        self.typing_until.take().is_some()
    }

    fn is_live(&self) -> bool {
        self.state == ChannelState::Connected
    }
}

/// Push channel lifecycle manager.
///
/// One logical channel per chat room. Injected per session, so no state is
/// shared between sessions or test cases.
pub struct ConnectionManager<E: Environment> {
    env: E,
    policy: ReconnectPolicy,
    channels: BTreeMap<ChatId, Channel<E::Instant>>,
    /// Room whose liveness `is_connected` reports.
    active: Option<ChatId>,
    next_generation: Generation,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl<E: Environment> ConnectionManager<E> {
    /// Create a manager with the given reconnection policy.
    pub fn new(env: E, policy: ReconnectPolicy) -> Self {
        Self {
            env,
            policy,
            channels: BTreeMap::new(),
            active: None,
            next_generation: 1,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Open a channel scoped to `chat_id`.
    ///
    /// Returns `Ok` when the attempt was initiated (or a channel for the room
    /// already exists) and `Err` when credentials are missing. Missing
    /// credentials are fatal; the caller must re-authenticate.
    pub fn connect(
        &mut self,
        chat_id: ChatId,
        auth: &AuthContext,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if !auth.is_authenticated() {
            tracing::warn!(chat_id, "refusing to open channel without credentials");
            return Err(ConnectionError::Unauthenticated { chat_id });
        }

        let mut actions = Vec::new();
        match self.channels.get(&chat_id) {
            Some(channel) if channel.state != ChannelState::Failed => {
                self.active = Some(chat_id);
                return Ok(actions);
            },
            Some(channel) => {
                actions.push(ConnectionAction::Close { chat_id, generation: channel.generation });
            },
            None => {},
        }

        let generation = self.bump_generation();
        self.channels.insert(chat_id, Channel::new(generation));
        self.active = Some(chat_id);

        tracing::debug!(chat_id, generation, "opening channel");
        actions.push(ConnectionAction::Open { chat_id, generation });
        Ok(actions)
    }

    /// Tear down the room's channel.
    ///
    /// Idempotent: disconnecting an unknown or closed room returns no actions.
    pub fn disconnect(&mut self, chat_id: ChatId) -> Vec<ConnectionAction> {
        if self.active == Some(chat_id) {
            self.active = None;
        }

        let Some(channel) = self.channels.remove(&chat_id) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if channel.is_live() && channel.typing_until.is_some() {
            actions.push(ConnectionAction::Send {
                chat_id,
                generation: channel.generation,
                event: OutboundEvent::TypingStop,
            });
        }
        actions.push(ConnectionAction::Close { chat_id, generation: channel.generation });

        tracing::debug!(chat_id, generation = channel.generation, "channel disconnected");
        if channel.is_live() {
            self.notify(chat_id, false);
        }
        actions
    }

    /// Liveness of the most recently connected room.
    pub fn is_connected(&self) -> bool {
        self.active.and_then(|id| self.channels.get(&id)).is_some_and(Channel::is_live)
    }

    /// State of the room's channel.
    pub fn state(&self, chat_id: ChatId) -> ChannelState {
        self.channels.get(&chat_id).map_or(ChannelState::Disconnected, |c| c.state)
    }

    /// Current generation of the room's channel. `None` if disconnected.
    pub fn generation(&self, chat_id: ChatId) -> Option<Generation> {
        self.channels.get(&chat_id).map(|c| c.generation)
    }

    /// Consecutive failed attempts for the room.
    pub fn reconnect_attempts(&self, chat_id: ChatId) -> u32 {
        self.channels.get(&chat_id).map_or(0, |c| c.attempt)
    }

    /// Register a liveness observer.
    ///
    /// The callback fires on every transition with `(chat_id, connected)`.
    pub fn on_connection_change(
        &mut self,
        callback: impl FnMut(ChatId, bool) + Send + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Unregister a liveness observer. Returns `false` if unknown.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    /// Process a transport event for one open attempt.
    pub fn handle_channel_event(
        &mut self,
        chat_id: ChatId,
        generation: Generation,
        event: ChannelEvent,
        now: E::Instant,
    ) -> Vec<ConnectionAction> {
        let Some(channel) = self.channels.get_mut(&chat_id) else {
            tracing::trace!(chat_id, generation, "dropping event for closed channel");
            return Vec::new();
        };
        if channel.generation != generation {
            tracing::trace!(
                chat_id,
                generation,
                current = channel.generation,
                "dropping event from stale channel"
            );
            return Vec::new();
        }

        match event {
            ChannelEvent::Opened => {
                let was_live = channel.is_live();
                channel.state = ChannelState::Connected;
                channel.attempt = 0;
                channel.retry_at = None;

                tracing::info!(chat_id, generation, "channel connected");
                if !was_live {
                    self.notify(chat_id, true);
                }
                Vec::new()
            },
            ChannelEvent::Push(event) => vec![ConnectionAction::Deliver { chat_id, event }],
            ChannelEvent::Closed { reason } => {
                if channel.state == ChannelState::Failed {
                    return Vec::new();
                }

                let was_live = channel.is_live();
                let delay = self.policy.delay(channel.attempt, self.env.random_u64());
                channel.attempt = channel.attempt.saturating_add(1);
                channel.state = ChannelState::Reconnecting;
                channel.retry_at = Some(now + delay);
                channel.clear_typing();

                tracing::warn!(
                    chat_id,
                    generation,
                    %reason,
                    attempt = channel.attempt,
                    ?delay,
                    "channel closed, scheduling reconnect"
                );
                if was_live {
                    self.notify(chat_id, false);
                }
                Vec::new()
            },
            ChannelEvent::AuthRejected { reason } => {
                let was_live = channel.is_live();
                channel.state = ChannelState::Failed;
                channel.retry_at = None;
                channel.clear_typing();

                tracing::error!(chat_id, generation, %reason, "channel authentication rejected");
                if was_live {
                    self.notify(chat_id, false);
                }
                vec![ConnectionAction::Failed {
                    error: ConnectionError::AuthRejected { chat_id, reason },
                }]
            },
        }
    }

    /// Process periodic maintenance: due reconnects and typing expiry.
    pub fn tick(&mut self, now: E::Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        let mut due = Vec::new();
        for (&chat_id, channel) in &mut self.channels {
            if channel.state == ChannelState::Reconnecting
                && channel.retry_at.is_some_and(|at| at <= now)
            {
                due.push(chat_id);
            }
            if channel.typing_until.is_some_and(|at| at <= now) {
                channel.clear_typing();
                if channel.is_live() {
                    actions.push(ConnectionAction::Send {
                        chat_id,
                        generation: channel.generation,
                        event: OutboundEvent::TypingStop,
                    });
                }
            }
        }

        for chat_id in due {
            let generation = self.bump_generation();
            if let Some(channel) = self.channels.get_mut(&chat_id) {
                channel.generation = generation;
                channel.retry_at = None;
                tracing::info!(chat_id, generation, attempt = channel.attempt, "reconnecting");
                actions.push(ConnectionAction::Open { chat_id, generation });
            }
        }
        actions
    }

    /// Broadcast that the local user is typing.
    ///
    /// Every call restarts the auto-clear timer. A typing event goes out at
    /// most once per [`TYPING_BROADCAST_INTERVAL`], so peers keep seeing the
    /// indicator during long bursts. The first tick after the timer runs out
    /// sends a typing-stop.
    pub fn send_typing(&mut self, chat_id: ChatId, now: E::Instant) -> Vec<ConnectionAction> {
        let Some(channel) = self.channels.get_mut(&chat_id) else {
            return Vec::new();
        };
        if !channel.is_live() {
            return Vec::new();
        }

        channel.typing_until = Some(now + TYPING_BROADCAST_INTERVAL);
        if channel.typing_sent_at.is_some_and(|at| now < at + TYPING_BROADCAST_INTERVAL) {
            return Vec::new();
        }
        channel.typing_sent_at = Some(now);
        vec![ConnectionAction::Send {
            chat_id,
            generation: channel.generation,
            event: OutboundEvent::Typing,
        }]
    }

    /// Restart the auto-clear timer of an armed typing broadcast.
    pub fn start_typing_timer(&mut self, chat_id: ChatId, now: E::Instant) {
        if let Some(channel) = self.channels.get_mut(&chat_id)
            && channel.typing_until.is_some()
        {
            channel.typing_until = Some(now + TYPING_BROADCAST_INTERVAL);
        }
    }

    /// Clear the typing broadcast and tell peers, if one is armed.
    pub fn stop_typing(&mut self, chat_id: ChatId) -> Vec<ConnectionAction> {
        let Some(channel) = self.channels.get_mut(&chat_id) else {
            return Vec::new();
        };
        if !channel.clear_typing() || !channel.is_live() {
            return Vec::new();
        }

        vec![ConnectionAction::Send {
            chat_id,
            generation: channel.generation,
            event: OutboundEvent::TypingStop,
        }]
    }

    /// Whether a typing broadcast is armed for the room.
    pub fn is_typing(&self, chat_id: ChatId) -> bool {
        self.channels.get(&chat_id).is_some_and(|c| c.typing_until.is_some())
    }

    /// Earliest pending reconnect or typing deadline.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        self.channels.values().flat_map(|c| [c.retry_at, c.typing_until]).flatten().min()
    }

    fn bump_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn notify(&mut self, chat_id: ChatId, connected: bool) {
        for (_, observer) in &mut self.observers {
            observer(chat_id, connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        task::{Context, Poll},
        time::Instant,
    };

    use lessonhub_core::Role;

    use super::*;

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
            1_700_000_000_000
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

    fn manager() -> ConnectionManager<TestEnv> {
        ConnectionManager::new(TestEnv, ReconnectPolicy::default())
    }

    fn open(manager: &mut ConnectionManager<TestEnv>, chat_id: ChatId, now: Instant) -> Generation {
        let actions = manager.connect(chat_id, &auth()).unwrap();
        let Some(ConnectionAction::Open { generation, .. }) = actions.last().cloned() else {
            panic!("expected Open, got {actions:?}");
        };
        manager.handle_channel_event(chat_id, generation, ChannelEvent::Opened, now);
        generation
    }

    #[test]
    fn connect_without_token_fails() {
        let mut manager = manager();
        let mut signed_out = auth();
        signed_out.token = None;

        let result = manager.connect(5, &signed_out);
        assert_eq!(result, Err(ConnectionError::Unauthenticated { chat_id: 5 }));
        assert_eq!(manager.state(5), ChannelState::Disconnected);
    }

    #[test]
    fn connect_is_single_per_room() {
        let mut manager = manager();
        let first = manager.connect(5, &auth()).unwrap();
        let second = manager.connect(5, &auth()).unwrap();

        assert!(matches!(first.as_slice(), [ConnectionAction::Open { chat_id: 5, .. }]));
        assert!(second.is_empty());
        assert_eq!(manager.state(5), ChannelState::Connecting);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut manager = manager();
        let now = Instant::now();
        open(&mut manager, 5, now);

        let first = manager.disconnect(5);
        assert!(matches!(first.as_slice(), [ConnectionAction::Close { chat_id: 5, .. }]));
        assert!(manager.disconnect(5).is_empty());
        assert!(manager.disconnect(99).is_empty());
        assert!(!manager.is_connected());
    }

    #[test]
    fn closed_channel_reconnects_after_backoff() {
        let mut manager = manager();
        let now = Instant::now();
        let generation = open(&mut manager, 5, now);
        assert!(manager.is_connected());

        let closed = ChannelEvent::Closed { reason: "reset".into() };
        manager.handle_channel_event(5, generation, closed, now);
        assert!(!manager.is_connected());
        assert_eq!(manager.state(5), ChannelState::Reconnecting);

        // Zero randomness picks the low end of the jitter window (400ms).
        assert!(manager.tick(now + Duration::from_millis(399)).is_empty());
        let actions = manager.tick(now + Duration::from_millis(400));
        let [ConnectionAction::Open { chat_id: 5, generation: next }] = actions.as_slice() else {
            panic!("expected reopen, got {actions:?}");
        };
        assert!(*next > generation);

        manager.handle_channel_event(5, *next, ChannelEvent::Opened, now);
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(5), 0);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut manager = manager();
        let now = Instant::now();
        let generation = open(&mut manager, 5, now);
        manager.disconnect(5);

        let actions = manager.connect(5, &auth()).unwrap();
        let [ConnectionAction::Open { generation: fresh, .. }] = actions.as_slice() else {
            panic!("expected Open");
        };
        assert_ne!(*fresh, generation);

        let push = ChannelEvent::Push(PushEvent::Error { message: "late".into() });
        assert!(manager.handle_channel_event(5, generation, push, now).is_empty());
        manager.handle_channel_event(5, generation, ChannelEvent::Opened, now);
        assert_eq!(manager.state(5), ChannelState::Connecting);
    }

    #[test]
    fn auth_rejection_is_fatal() {
        let mut manager = manager();
        let now = Instant::now();
        let generation = open(&mut manager, 5, now);

        let rejected = ChannelEvent::AuthRejected { reason: "expired".into() };
        let actions = manager.handle_channel_event(5, generation, rejected, now);
        assert!(matches!(actions.as_slice(), [ConnectionAction::Failed {
            error: ConnectionError::AuthRejected { chat_id: 5, .. }
        }]));
        assert_eq!(manager.state(5), ChannelState::Failed);
        assert!(manager.tick(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn observers_see_every_transition() {
        let mut manager = manager();
        let transitions = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&transitions);
        let id = manager.on_connection_change(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let now = Instant::now();
        let generation = open(&mut manager, 5, now);
        let closed = ChannelEvent::Closed { reason: "x".into() };
        manager.handle_channel_event(5, generation, closed, now);
        assert_eq!(transitions.load(Ordering::SeqCst), 2);

        assert!(manager.remove_observer(id));
        assert!(!manager.remove_observer(id));
    }

    #[test]
    fn typing_broadcast_is_debounced() {
        let mut manager = manager();
        let now = Instant::now();
        open(&mut manager, 5, now);

        let first = manager.send_typing(5, now);
        assert!(matches!(first.as_slice(), [ConnectionAction::Send {
            event: OutboundEvent::Typing,
            ..
        }]));
        assert!(manager.send_typing(5, now + Duration::from_secs(1)).is_empty());
        assert!(manager.send_typing(5, now + Duration::from_secs(2)).is_empty());
        assert_eq!(manager.send_typing(5, now + TYPING_BROADCAST_INTERVAL).len(), 1);

        let stop = manager.stop_typing(5);
        assert!(matches!(stop.as_slice(), [ConnectionAction::Send {
            event: OutboundEvent::TypingStop,
            ..
        }]));
        assert!(manager.stop_typing(5).is_empty());
    }

    #[test]
    fn typing_auto_clears_with_stop_event() {
        let mut manager = manager();
        let now = Instant::now();
        open(&mut manager, 5, now);

        manager.send_typing(5, now);
        assert!(manager.tick(now + Duration::from_millis(2999)).is_empty());

        let actions = manager.tick(now + TYPING_BROADCAST_INTERVAL);
        assert!(matches!(actions.as_slice(), [ConnectionAction::Send {
            event: OutboundEvent::TypingStop,
            ..
        }]));
        assert!(!manager.is_typing(5));
    }

    #[test]
    fn typing_timer_restart_extends_deadline() {
        let mut manager = manager();
        let now = Instant::now();
        open(&mut manager, 5, now);

        manager.send_typing(5, now);
        manager.start_typing_timer(5, now + Duration::from_secs(2));
        assert!(manager.tick(now + TYPING_BROADCAST_INTERVAL).is_empty());
        assert!(manager.is_typing(5));

        assert_eq!(manager.tick(now + Duration::from_secs(5)).len(), 1);
        assert!(!manager.is_typing(5));
    }
}
