//! Transport abstraction
//!
//! A transport turns a signal-channel handshake into a bidirectional
//! byte stream between two peers. The swarm hands each connection attempt
//! a [`SignalLink`] carrying the handshake messages for that pair only.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::keys::{PeerId, Topic};
use crate::signal::{SignalChannel, SignalMessage, SignalPayload};

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Signal failed: {0}")]
    Signal(String),
    #[error("Unexpected handshake message: {0}")]
    Handshake(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
}

/// Handshake channel between two peers over the signal channel
pub struct SignalLink {
    topic: Topic,
    local: PeerId,
    remote: PeerId,
    channel: Arc<dyn SignalChannel>,
    inbox: mpsc::UnboundedReceiver<SignalPayload>,
}

impl SignalLink {
    pub fn new(
        topic: Topic,
        local: PeerId,
        remote: PeerId,
        channel: Arc<dyn SignalChannel>,
        inbox: mpsc::UnboundedReceiver<SignalPayload>,
    ) -> Self {
        Self {
            topic,
            local,
            remote,
            channel,
            inbox,
        }
    }

    /// Send a handshake payload directed at the remote peer
    pub async fn send(&self, payload: SignalPayload) -> Result<(), TransportError> {
        let message = SignalMessage::directed(self.topic, self.local, self.remote, payload);
        self.channel
            .publish(message)
            .await
            .map_err(|e| TransportError::Signal(e.to_string()))
    }

    /// Next handshake payload from the remote peer
    pub async fn recv(&mut self) -> Option<SignalPayload> {
        self.inbox.recv().await
    }

    /// Wait for an offer, skipping stray candidates
    pub async fn expect_offer(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.recv().await {
                Some(SignalPayload::Offer { data }) => return Ok(data),
                Some(SignalPayload::Candidate { .. }) => continue,
                Some(other) => return Err(TransportError::Handshake(format!("{:?}", other))),
                None => return Err(TransportError::Disconnected),
            }
        }
    }

    /// Wait for an answer, skipping stray candidates
    pub async fn expect_answer(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.recv().await {
                Some(SignalPayload::Answer { data }) => return Ok(data),
                Some(SignalPayload::Candidate { .. }) => continue,
                Some(other) => return Err(TransportError::Handshake(format!("{:?}", other))),
                None => return Err(TransportError::Disconnected),
            }
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }
}

/// Parameters for a single connection attempt
pub struct ConnectRequest {
    pub topic: Topic,
    pub local: PeerId,
    pub remote: PeerId,
    /// True on the side that sends the offer
    pub initiator: bool,
    pub link: SignalLink,
}

/// Established bidirectional byte stream with a remote peer
#[async_trait]
pub trait DuplexStream: Send + Sync {
    /// The peer on the other end
    fn remote(&self) -> &PeerId;

    /// Send one message
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Receive the next message, or None once the stream is closed
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Close the stream; both ends observe the closure
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Factory for peer connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Run the handshake described by `request` and return the stream
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn DuplexStream>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn DuplexStream>, TransportError> {
        (**self).connect(request).await
    }
}
