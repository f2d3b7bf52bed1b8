//! WebSocket signal server and client
//!
//! The server keeps one routing table (a [`MemorySignalContext`]) and lets
//! remote clients subscribe and publish over JSON text frames:
//! - client `{"op":"subscribe","id":1,"topic":"..","peerId":".."}`
//! - client `{"op":"unsubscribe","id":1}`
//! - client `{"op":"publish","message":{..}}`
//! - server `{"op":"subscribed","id":1}`
//! - server `{"op":"message","id":1,"message":{..}}`
//!
//! The server acknowledges a subscribe once it is registered, and the
//! client's `subscribe` does not return before that ack arrives. When a
//! client goes away without unsubscribing, the server publishes `Leave` on
//! its behalf for every topic it was still subscribed to.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::keys::{PeerId, Topic};
use crate::memory::MemorySignalContext;
use crate::signal::{SignalChannel, SignalError, SignalMessage, SignalPayload, Subscription};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe { id: u64, topic: Topic, peer_id: PeerId },
    Unsubscribe { id: u64 },
    Publish { message: SignalMessage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ServerFrame {
    Subscribed { id: u64 },
    Message { id: u64, message: SignalMessage },
}

fn ws_error(e: impl std::fmt::Display) -> SignalError {
    SignalError::WebSocket(e.to_string())
}

// ============================================================================
// Server
// ============================================================================

/// Signal server relaying topic traffic between WebSocket clients
pub struct SignalServer {
    local_addr: SocketAddr,
    context: Arc<MemorySignalContext>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalServer {
    /// Bind and start accepting clients
    pub async fn bind(addr: &str) -> Result<Self, SignalError> {
        let listener = TcpListener::bind(addr).await.map_err(ws_error)?;
        let local_addr = listener.local_addr().map_err(ws_error)?;
        let context = MemorySignalContext::new();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, context.clone(), shutdown_rx));
        info!("signal server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            context,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Routing table shared by all clients
    pub fn context(&self) -> &Arc<MemorySignalContext> {
        &self.context
    }

    /// Run until the accept loop stops
    pub async fn run(self) {
        let _ = self.task.await;
    }

    /// Stop accepting and drop every client
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<MemorySignalContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut clients = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("signal client connected from {}", peer);
                    clients.push(tokio::spawn(serve_client(stream, context.clone())));
                    clients.retain(|c: &JoinHandle<()>| !c.is_finished());
                }
                Err(e) => warn!("accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
    for client in clients {
        client.abort();
    }
}

async fn serve_client(stream: TcpStream, context: Arc<MemorySignalContext>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed: {}", e);
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Live subscriptions of this client: forwarder task and who subscribed
    let mut forwarders: HashMap<u64, (JoinHandle<()>, Topic, PeerId)> = HashMap::new();
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("bad client frame: {}", e);
                continue;
            }
        };
        match frame {
            ClientFrame::Subscribe { id, topic, peer_id } => {
                let mut subscription = context.register(topic, peer_id);
                // Queued ahead of anything the forwarder sends for this id
                let _ = out_tx.send(ServerFrame::Subscribed { id });
                let out = out_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        if out.send(ServerFrame::Message { id, message }).is_err() {
                            break;
                        }
                    }
                });
                if let Some((previous, _, _)) = forwarders.insert(id, (forwarder, topic, peer_id)) {
                    previous.abort();
                }
            }
            ClientFrame::Unsubscribe { id } => {
                if let Some((forwarder, _, _)) = forwarders.remove(&id) {
                    forwarder.abort();
                }
            }
            ClientFrame::Publish { message } => {
                context.route(&message);
            }
        }
    }

    writer.abort();
    for (_, (forwarder, topic, peer_id)) in forwarders {
        forwarder.abort();
        let delivered = context.route(&SignalMessage::broadcast(topic, peer_id, SignalPayload::Leave));
        debug!(
            "signal client {} dropped off {}, leave sent to {} peers",
            peer_id.short(),
            topic.short(),
            delivered
        );
    }
    debug!("signal client disconnected");
}

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
struct ClientRoutes {
    routes: HashMap<u64, mpsc::UnboundedSender<SignalMessage>>,
    /// Subscribes still waiting for the server's ack
    pending: HashMap<u64, oneshot::Sender<()>>,
    closed: bool,
}

type Routes = Arc<Mutex<ClientRoutes>>;

/// Signal channel connected to a [`SignalServer`]
pub struct WebSocketSignalChannel {
    out: mpsc::UnboundedSender<ClientFrame>,
    routes: Routes,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketSignalChannel {
    pub async fn connect(url: &str) -> Result<Self, SignalError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(ws_error)?;
        let (mut sink, mut source) = ws.split();
        let (out, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let routes: Routes = Arc::new(Mutex::new(ClientRoutes::default()));

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_routes = routes.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = source.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Subscribed { id }) => {
                        let mut routes = reader_routes.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(ack) = routes.pending.remove(&id) {
                            let _ = ack.send(());
                        }
                    }
                    Ok(ServerFrame::Message { id, message }) => {
                        let routes = reader_routes.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(tx) = routes.routes.get(&id) {
                            let _ = tx.send(message);
                        }
                    }
                    Err(e) => debug!("bad server frame: {}", e),
                }
            }
            // Ending every subscription tells swarms the channel is gone
            let mut routes = reader_routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.closed = true;
            routes.routes.clear();
            routes.pending.clear();
        });

        info!("connected to signal server {}", url);
        Ok(Self {
            out,
            routes,
            next_id: AtomicU64::new(0),
            reader,
            writer,
        })
    }
}

impl Drop for WebSocketSignalChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl SignalChannel for WebSocketSignalChannel {
    async fn publish(&self, message: SignalMessage) -> Result<(), SignalError> {
        self.out
            .send(ClientFrame::Publish { message })
            .map_err(|_| SignalError::Closed)
    }

    /// Returns once the server has registered the subscription
    async fn subscribe(&self, topic: Topic, peer_id: PeerId) -> Result<Subscription, SignalError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            if routes.closed {
                return Err(SignalError::Closed);
            }
            routes.routes.insert(id, tx);
            routes.pending.insert(id, ack_tx);
        }

        let routes = self.routes.clone();
        let out = self.out.clone();
        // Built before the ack so a cancelled or failed subscribe still unsubscribes
        let subscription = Subscription::new(topic, rx, move || {
            let mut state = routes.lock().unwrap_or_else(PoisonError::into_inner);
            state.routes.remove(&id);
            state.pending.remove(&id);
            drop(state);
            let _ = out.send(ClientFrame::Unsubscribe { id });
        });

        self.out
            .send(ClientFrame::Subscribe { id, topic, peer_id })
            .map_err(|_| SignalError::Closed)?;
        ack_rx.await.map_err(|_| SignalError::Closed)?;
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_frame_json() {
        let frame = ClientFrame::Subscribe {
            id: 3,
            topic: Topic::from_bytes([1; 32]),
            peer_id: PeerId::from_bytes([2; 32]),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"subscribe\""));
        assert!(json.contains("\"peerId\""));
    }

    #[test]
    fn test_server_frame_json() {
        let json = serde_json::to_string(&ServerFrame::Subscribed { id: 7 }).unwrap();
        assert_eq!(json, r#"{"op":"subscribed","id":7}"#);
    }

    #[tokio::test]
    async fn test_pubsub_over_websocket() {
        let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
        let a = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let b = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let topic = Topic::random();
        let a_id = PeerId::random();
        let b_id = PeerId::random();

        let mut b_sub = b.subscribe(topic, b_id).await.unwrap();
        let _a_sub = a.subscribe(topic, a_id).await.unwrap();
        assert_eq!(server.context().subscriber_count(&topic), 2);

        a.publish(SignalMessage::broadcast(topic, a_id, SignalPayload::Announce))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), b_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.author, a_id);
        assert_eq!(received.payload, SignalPayload::Announce);

        b_sub.unsubscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.context().subscriber_count(&topic) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_right_after_subscribe_is_delivered() {
        let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
        let a = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let b = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let b_id = PeerId::random();

        for round in 0..50u8 {
            let topic = Topic::random();
            let a_id = PeerId::from_bytes([round; 32]);
            let mut a_sub = a.subscribe(topic, a_id).await.unwrap();
            // Another connection publishes with no delay
            b.publish(SignalMessage::directed(topic, b_id, a_id, SignalPayload::Announce))
                .await
                .unwrap();
            let received = tokio::time::timeout(Duration::from_secs(5), a_sub.recv())
                .await
                .unwrap_or_else(|_| panic!("round {} lost the first message", round))
                .unwrap();
            assert_eq!(received.author, b_id);
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_after_server_gone_fails() {
        let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
        let a = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        server.shutdown().await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            a.subscribe(Topic::random(), PeerId::random()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SignalError::Closed)));
    }

    #[tokio::test]
    async fn test_dropped_client_leaves_its_topics() {
        let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
        let a = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let b = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
        let topic = Topic::random();
        let a_id = PeerId::random();
        let b_id = PeerId::random();

        let mut b_sub = b.subscribe(topic, b_id).await.unwrap();
        let a_sub = a.subscribe(topic, a_id).await.unwrap();

        // The connection goes away without unsubscribing
        drop(a);
        let received = tokio::time::timeout(Duration::from_secs(5), b_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.author, a_id);
        assert_eq!(received.payload, SignalPayload::Leave);

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.context().subscriber_count(&topic) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(a_sub);
        server.shutdown().await;
    }
}
