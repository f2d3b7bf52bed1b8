//! Signal channel abstraction
//!
//! Topic-scoped publish/subscribe used to discover peers and to exchange
//! connection setup data. Implemented in memory for tests and simulation
//! (see [`crate::memory`]) and over WebSocket (see [`crate::ws_signal`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::keys::{PeerId, Topic};

/// Errors from signal channel operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Signal channel closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Body of a signal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalPayload {
    /// Presence announcement; broadcast on join and periodically
    Announce,
    /// The author is leaving the swarm
    Leave,
    /// Ask the recipient to initiate a connection to the author
    ConnectRequest,
    /// Transport-specific connection offer
    Offer {
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
    /// Transport-specific answer to an offer
    Answer {
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
    /// Additional transport-specific setup data
    Candidate {
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
}

impl SignalPayload {
    /// Whether this payload belongs to a connection handshake
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            SignalPayload::Offer { .. } | SignalPayload::Answer { .. } | SignalPayload::Candidate { .. }
        )
    }
}

/// Message published on a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub topic: Topic,
    pub author: PeerId,
    /// Directed messages are only delivered to this peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PeerId>,
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn broadcast(topic: Topic, author: PeerId, payload: SignalPayload) -> Self {
        Self {
            topic,
            author,
            recipient: None,
            payload,
        }
    }

    pub fn directed(topic: Topic, author: PeerId, recipient: PeerId, payload: SignalPayload) -> Self {
        Self {
            topic,
            author,
            recipient: Some(recipient),
            payload,
        }
    }

    /// Whether a subscriber with this peer id should see the message
    ///
    /// Authors never receive their own messages.
    pub fn is_for(&self, peer_id: &PeerId) -> bool {
        self.author != *peer_id && self.recipient.map_or(true, |r| r == *peer_id)
    }

    pub fn to_json(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(|e| SignalError::Codec(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, SignalError> {
        serde_json::from_str(s).map_err(|e| SignalError::Codec(e.to_string()))
    }
}

/// Active subscription to a topic
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// releases it on the underlying channel synchronously.
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        rx: mpsc::UnboundedReceiver<SignalMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Receive the next message, or None once the channel is gone
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Topic-scoped publish/subscribe
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Publish a message to every subscriber of its topic
    async fn publish(&self, message: SignalMessage) -> Result<(), SignalError>;

    /// Subscribe to a topic as `peer_id`
    ///
    /// Resolves once the subscription is registered, so messages published
    /// afterwards are delivered.
    async fn subscribe(&self, topic: Topic, peer_id: PeerId) -> Result<Subscription, SignalError>;
}

#[async_trait]
impl<T: SignalChannel + ?Sized> SignalChannel for std::sync::Arc<T> {
    async fn publish(&self, message: SignalMessage) -> Result<(), SignalError> {
        (**self).publish(message).await
    }

    async fn subscribe(&self, topic: Topic, peer_id: PeerId) -> Result<Subscription, SignalError> {
        (**self).subscribe(topic, peer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serde_tags() {
        let msg = SignalMessage::broadcast(Topic::random(), PeerId::random(), SignalPayload::Announce);
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"announce\""));
        assert!(!json.contains("recipient"));
        assert_eq!(SignalMessage::from_json(&json).unwrap(), msg);

        let offer = SignalMessage::directed(
            Topic::random(),
            PeerId::random(),
            PeerId::random(),
            SignalPayload::Offer { data: vec![0xde, 0xad] },
        );
        let json = offer.to_json().unwrap();
        assert!(json.contains("\"data\":\"dead\""));
        assert!(json.contains("\"type\":\"offer\""));
        assert_eq!(SignalMessage::from_json(&json).unwrap(), offer);
    }

    #[test]
    fn test_connect_request_tag() {
        let json = serde_json::to_string(&SignalPayload::ConnectRequest).unwrap();
        assert_eq!(json, r#"{"type":"connectRequest"}"#);
    }

    #[test]
    fn test_is_for() {
        let author = PeerId::random();
        let other = PeerId::random();
        let third = PeerId::random();
        let topic = Topic::random();

        let broadcast = SignalMessage::broadcast(topic, author, SignalPayload::Announce);
        assert!(!broadcast.is_for(&author));
        assert!(broadcast.is_for(&other));

        let directed = SignalMessage::directed(topic, author, other, SignalPayload::ConnectRequest);
        assert!(directed.is_for(&other));
        assert!(!directed.is_for(&third));
    }

    #[tokio::test]
    async fn test_subscription_release_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::unbounded_channel();
        let sub = Subscription::new(Topic::random(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
