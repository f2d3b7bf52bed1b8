//! In-memory signal channel and transport
//!
//! Used by tests and the simulator. Peers that should see each other share
//! one [`MemorySignalContext`] and one [`MemoryTransportContext`]; nothing
//! is global, so independent tests never interfere.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::keys::{PeerId, Topic};
use crate::signal::{SignalChannel, SignalError, SignalMessage, SignalPayload, Subscription};
use crate::transport::{ConnectRequest, DuplexStream, Transport, TransportError};

// ============================================================================
// Signal channel
// ============================================================================

struct Listener {
    id: u64,
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    topics: HashMap<Topic, Vec<Listener>>,
}

/// Shared routing table for in-memory signaling
#[derive(Default)]
pub struct MemorySignalContext {
    routes: Mutex<Routes>,
}

impl MemorySignalContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for `topic`
    pub fn register(self: &Arc<Self>, topic: Topic, peer_id: PeerId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.next_id += 1;
            let id = routes.next_id;
            routes
                .topics
                .entry(topic)
                .or_default()
                .push(Listener { id, peer_id, tx });
            id
        };
        trace!("subscribed {} to {}", peer_id.short(), topic.short());

        let context: Weak<Self> = Arc::downgrade(self);
        Subscription::new(topic, rx, move || {
            if let Some(context) = context.upgrade() {
                context.unregister(&topic, id);
            }
        })
    }

    fn unregister(&self, topic: &Topic, id: u64) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listeners) = routes.topics.get_mut(topic) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                routes.topics.remove(topic);
            }
        }
    }

    /// Deliver a message to matching subscribers; returns how many got it
    pub fn route(&self, message: &SignalMessage) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = routes.topics.get(&message.topic) else {
            return 0;
        };
        listeners
            .iter()
            .filter(|l| message.is_for(&l.peer_id))
            .filter(|l| l.tx.send(message.clone()).is_ok())
            .count()
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.topics.get(topic).map_or(0, |l| l.len())
    }

    /// Number of topics with at least one subscription
    pub fn topic_count(&self) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.topics.len()
    }
}

/// Signal channel backed by a [`MemorySignalContext`]
#[derive(Clone)]
pub struct MemorySignalChannel {
    context: Arc<MemorySignalContext>,
}

impl MemorySignalChannel {
    pub fn new(context: Arc<MemorySignalContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<MemorySignalContext> {
        &self.context
    }
}

#[async_trait]
impl SignalChannel for MemorySignalChannel {
    async fn publish(&self, message: SignalMessage) -> Result<(), SignalError> {
        let delivered = self.context.route(&message);
        trace!(
            "{} published {:?} on {} ({} recipients)",
            message.author.short(),
            message.payload,
            message.topic.short(),
            delivered
        );
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, peer_id: PeerId) -> Result<Subscription, SignalError> {
        Ok(self.context.register(topic, peer_id))
    }
}

// ============================================================================
// Duplex stream
// ============================================================================

/// One end of an in-memory connection
pub struct MemoryStream {
    remote: PeerId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
    latency: Duration,
}

impl MemoryStream {
    /// Create a connected pair; the first end belongs to `a`, the second to `b`
    pub fn pair(a: PeerId, b: PeerId) -> (Self, Self) {
        Self::pair_with_latency(a, b, Duration::ZERO)
    }

    pub fn pair_with_latency(a: PeerId, b: PeerId, latency: Duration) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let a_end = Self {
            remote: b,
            tx: a_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            closed: closed.clone(),
            latency,
        };
        let b_end = Self {
            remote: a,
            tx: b_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            closed,
            latency,
        };
        (a_end, b_end)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DuplexStream for MemoryStream {
    fn remote(&self) -> &PeerId {
        &self.remote
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.tx.send(data).map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        if *closed.borrow() {
            return rx.try_recv().ok();
        }
        // Messages already queued when the link closes are still delivered
        tokio::select! {
            biased;
            data = rx.recv() => data,
            _ = closed.changed() => rx.try_recv().ok(),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && !self.tx.is_closed()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Rendezvous point where initiators park the responder's stream end
#[derive(Default)]
pub struct MemoryTransportContext {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, MemoryStream>>,
}

impl MemoryTransportContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn park(self: &Arc<Self>, stream: MemoryStream) -> ParkedStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stream);
        ParkedStream {
            id,
            context: self.clone(),
        }
    }

    fn take(&self, id: u64) -> Option<MemoryStream> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Streams offered but not yet picked up
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Removes a parked stream if the attempt ends before it is picked up
struct ParkedStream {
    id: u64,
    context: Arc<MemoryTransportContext>,
}

impl Drop for ParkedStream {
    fn drop(&mut self) {
        self.context.take(self.id);
    }
}

/// Transport connecting peers through a shared [`MemoryTransportContext`]
#[derive(Clone)]
pub struct MemoryTransport {
    context: Arc<MemoryTransportContext>,
    latency: Duration,
}

impl MemoryTransport {
    pub fn new(context: Arc<MemoryTransportContext>) -> Self {
        Self {
            context,
            latency: Duration::ZERO,
        }
    }

    /// Delay applied to every message sent over streams from this transport
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn context(&self) -> &Arc<MemoryTransportContext> {
        &self.context
    }
}

fn decode_offer_id(data: &[u8]) -> Result<u64, TransportError> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| TransportError::Handshake(format!("bad offer length {}", data.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn DuplexStream>, TransportError> {
        let ConnectRequest {
            local,
            remote,
            initiator,
            mut link,
            ..
        } = request;

        if initiator {
            let (ours, theirs) = MemoryStream::pair_with_latency(local, remote, self.latency);
            let parked = self.context.park(theirs);
            let offer = parked.id.to_be_bytes().to_vec();
            link.send(SignalPayload::Offer { data: offer.clone() }).await?;

            let answer = link.expect_answer().await?;
            if answer != offer {
                return Err(TransportError::Handshake("answer does not match offer".into()));
            }
            debug!("memory link {} -> {} established", local.short(), remote.short());
            drop(parked);
            Ok(Box::new(ours))
        } else {
            let offer = link.expect_offer().await?;
            let id = decode_offer_id(&offer)?;
            let stream = self
                .context
                .take(id)
                .ok_or_else(|| TransportError::ConnectionFailed(format!("unknown offer {}", id)))?;
            if stream.remote != remote {
                return Err(TransportError::ConnectionFailed("offer from unexpected peer".into()));
            }
            link.send(SignalPayload::Answer { data: offer }).await?;
            debug!("memory link {} <- {} accepted", local.short(), remote.short());
            Ok(Box::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SignalLink;

    #[tokio::test]
    async fn test_routing_filters_author_and_recipient() {
        let ctx = MemorySignalContext::new();
        let topic = Topic::random();
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();

        let mut sub_a = ctx.register(topic, a);
        let mut sub_b = ctx.register(topic, b);
        let mut sub_c = ctx.register(topic, c);
        assert_eq!(ctx.subscriber_count(&topic), 3);

        let delivered = ctx.route(&SignalMessage::broadcast(topic, a, SignalPayload::Announce));
        assert_eq!(delivered, 2);
        assert!(sub_a.try_recv().is_none());
        assert!(sub_b.try_recv().is_some());
        assert!(sub_c.try_recv().is_some());

        ctx.route(&SignalMessage::directed(topic, a, b, SignalPayload::ConnectRequest));
        assert!(sub_b.try_recv().is_some());
        assert!(sub_c.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_route() {
        let ctx = MemorySignalContext::new();
        let topic = Topic::random();
        let sub = ctx.register(topic, PeerId::random());
        assert_eq!(ctx.topic_count(), 1);
        sub.unsubscribe();
        assert_eq!(ctx.subscriber_count(&topic), 0);
        assert_eq!(ctx.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_pair() {
        let a = PeerId::random();
        let b = PeerId::random();
        let (a_end, b_end) = MemoryStream::pair(a, b);
        assert_eq!(a_end.remote(), &b);
        assert_eq!(b_end.remote(), &a);

        a_end.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(b_end.recv().await, Some(b"hello".to_vec()));

        b_end.send(b"world".to_vec()).await.unwrap();
        assert_eq!(a_end.recv().await, Some(b"world".to_vec()));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let (a_end, b_end) = MemoryStream::pair(PeerId::random(), PeerId::random());
        a_end.send(b"last".to_vec()).await.unwrap();
        a_end.close().await;

        assert!(!a_end.is_open());
        assert!(!b_end.is_open());
        assert_eq!(b_end.recv().await, Some(b"last".to_vec()));
        assert_eq!(b_end.recv().await, None);
        assert!(b_end.send(b"x".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_transport_handshake() {
        let signals = MemorySignalContext::new();
        let channel: Arc<dyn SignalChannel> = Arc::new(MemorySignalChannel::new(signals));
        let transport = MemoryTransport::new(MemoryTransportContext::new());
        let topic = Topic::random();
        let a = PeerId::random();
        let b = PeerId::random();

        // Wire the two links directly: a's outgoing handshake goes to b's inbox
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let mut a_sub = channel.subscribe(topic, a).await.unwrap();
        let mut b_sub = channel.subscribe(topic, b).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = a_sub.recv().await {
                let _ = a_tx.send(msg.payload);
            }
        });
        tokio::spawn(async move {
            while let Some(msg) = b_sub.recv().await {
                let _ = b_tx.send(msg.payload);
            }
        });

        let initiator = transport.connect(ConnectRequest {
            topic,
            local: a,
            remote: b,
            initiator: true,
            link: SignalLink::new(topic, a, b, channel.clone(), a_rx),
        });
        let responder = transport.connect(ConnectRequest {
            topic,
            local: b,
            remote: a,
            initiator: false,
            link: SignalLink::new(topic, b, a, channel.clone(), b_rx),
        });
        let (a_stream, b_stream) = tokio::join!(initiator, responder);
        let a_stream = a_stream.unwrap();
        let b_stream = b_stream.unwrap();

        a_stream.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b_stream.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(transport.context().pending_count(), 0);
    }
}
