//! Collaborator boundaries.
//!
//! The runtime talks to the outside world through two traits: [`ChatApi`] for
//! request/response calls and [`PushTransport`] for per-chat push channels.
//! Production wires them to the platform's HTTP client and socket layer; the
//! simulation harness implements both in memory.

use std::future::Future;

use lessonhub_core::{
    ApiError, Attachment, AuthContext, Chat, ChatId, Message, MessageId, OutboundEvent, PushEvent,
    TransportError,
};
use tokio::sync::mpsc;

/// REST collaborator.
///
/// Every call may fail with an [`ApiError`]; the session decides how each
/// failure is surfaced.
pub trait ChatApi: Clone + Send + Sync + 'static {
    /// Chats visible to the signed-in user.
    fn fetch_chat_list(&self) -> impl Future<Output = Result<Vec<Chat>, ApiError>> + Send;

    /// One page of a chat's history, skipping the `offset` newest messages.
    fn fetch_message_history(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Persist a new message and return the stored record.
    fn send_message(
        &self,
        chat_id: ChatId,
        content: String,
        attachment: Option<Attachment>,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;

    /// Replace a message's text and return the stored record.
    fn edit_message(
        &self,
        message_id: MessageId,
        content: String,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;

    /// Delete a message.
    fn delete_message(&self, message_id: MessageId)
    -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Mark every message in a chat as read by the signed-in user.
    fn mark_chat_read(&self, chat_id: ChatId) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Push channel collaborator.
pub trait PushTransport: Clone + Send + Sync + 'static {
    /// Open a channel subscribed to one chat room.
    ///
    /// Fails with [`TransportError::Unauthorized`] when the credentials are
    /// rejected.
    fn open_channel(
        &self,
        chat_id: ChatId,
        auth: &AuthContext,
    ) -> impl Future<Output = Result<ChannelHandle, TransportError>> + Send;
}

/// Client end of an open push channel.
///
/// The inbound stream ending means the channel closed unexpectedly. Dropping
/// the handle closes the channel.
#[derive(Debug)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<OutboundEvent>,
    inbound: mpsc::Receiver<Result<PushEvent, TransportError>>,
}

/// Server end of a channel created by [`ChannelHandle::pair`].
#[derive(Debug)]
pub struct ChannelEndpoint {
    /// Events to deliver to the client.
    pub inbound: mpsc::Sender<Result<PushEvent, TransportError>>,
    /// Events sent by the client.
    pub outbound: mpsc::Receiver<OutboundEvent>,
}

impl ChannelHandle {
    /// Connected handle and endpoint with the given buffer size per direction.
    pub fn pair(buffer: usize) -> (Self, ChannelEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let handle = Self { outbound: outbound_tx, inbound: inbound_rx };
        (handle, ChannelEndpoint { inbound: inbound_tx, outbound: outbound_rx })
    }

    /// Send an event to the server.
    pub async fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::Closed("server end dropped".into()))
    }

    /// Next event from the server. `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<Result<PushEvent, TransportError>> {
        self.inbound.recv().await
    }

    /// Close the channel.
    pub fn close(self) {
        drop(self);
    }
}

impl ChannelEndpoint {
    /// Whether the client end is gone.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}
