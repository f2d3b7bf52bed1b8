//! Swarm membership and connection management
//!
//! [`NetworkManager`] owns one actor task per joined topic. The actor:
//! - announces itself on the signal channel on join and periodically
//! - tracks known peers from announcements and leave notices, and forgets
//!   peers that stay silent for [`SwarmConfig::peer_expiry`]
//! - runs the topology over the known set and opens missing connections
//! - drives plugins from connection lifecycle and inbound frames
//!
//! Only one side of each pair initiates: the peer with the smaller id. A
//! peer that wants a connection the other side has not opened asks for it
//! with a directed `ConnectRequest`. If offers still collide, the larger id
//! abandons its attempt and answers the incoming offer, so at most one live
//! connection exists per pair.
//!
//! Tasks spawned by the actor and the contexts handed to plugins only hold
//! a weak [`SwarmLink`]. Once every [`SwarmHandle`] is gone the actor stops
//! as if the swarm had been left.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::keys::{PeerId, Topic};
use crate::plugin::{ExtensionContext, Plugin, ProtocolPlugin, SwarmContext};
use crate::protocol::parse_frame;
use crate::signal::{SignalChannel, SignalError, SignalMessage, SignalPayload, Subscription};
use crate::topology::{FullyConnected, Topology};
use crate::transport::{ConnectRequest, DuplexStream, SignalLink, Transport, TransportError};

/// Swarm timing parameters
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Interval between presence announcements on the signal channel
    pub announce_interval: Duration,
    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Delay before re-evaluating targets after a failed or dropped connection
    pub retry_delay: Duration,
    /// Capacity of the swarm event broadcast
    pub event_capacity: usize,
    /// Announce intervals a peer may stay silent before it is forgotten
    pub peer_expiry_intervals: u32,
}

impl SwarmConfig {
    /// Silence after which an unconnected peer is dropped from the known set
    pub fn peer_expiry(&self) -> Duration {
        self.announce_interval * self.peer_expiry_intervals.max(1)
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
            event_capacity: 256,
            peer_expiry_intervals: 3,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("Already joined swarm {0}")]
    AlreadyJoined(Topic),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("Swarm closed")]
    Closed,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Peer is known but no connection exists
    Discovered,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of one peer's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    pub direction: Option<Direction>,
}

/// Swarm lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    PeerDiscovered(PeerId),
    PeerLeft(PeerId),
    Connected(PeerId),
    Disconnected(PeerId),
    ConnectFailed { peer_id: PeerId, reason: String },
}

/// Whether `local` initiates the connection to `remote`
pub fn is_initiator(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

pub(crate) enum Command {
    Leave(oneshot::Sender<()>),
    Connections(oneshot::Sender<Vec<ConnectionInfo>>),
    KnownPeers(oneshot::Sender<BTreeSet<PeerId>>),
    Discover(Vec<PeerId>),
    Reevaluate,
    ConnectSucceeded {
        peer_id: PeerId,
        attempt: u64,
        stream: Arc<dyn DuplexStream>,
    },
    ConnectFailed {
        peer_id: PeerId,
        attempt: u64,
        error: TransportError,
    },
    Frame {
        peer_id: PeerId,
        attempt: u64,
        data: Vec<u8>,
    },
    StreamClosed {
        peer_id: PeerId,
        attempt: u64,
    },
}

/// Handle plugins use to feed the swarm
///
/// Does not keep the swarm alive.
#[derive(Clone)]
pub struct SwarmLink {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SwarmLink {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            commands: commands.downgrade(),
        }
    }

    /// False once the swarm has stopped
    fn send(&self, command: Command) -> bool {
        match self.commands.upgrade() {
            Some(commands) => commands.send(command).is_ok(),
            None => false,
        }
    }

    /// Add peers learned out of band to the known set
    pub fn discover(&self, peers: Vec<PeerId>) {
        if !peers.is_empty() {
            self.send(Command::Discover(peers));
        }
    }
}

/// Options for joining a swarm
#[derive(Clone)]
pub struct JoinOptions {
    pub topic: Topic,
    pub peer_id: PeerId,
    pub topology: Arc<dyn Topology>,
    pub transport: Arc<dyn Transport>,
    pub plugins: Vec<Plugin>,
}

impl JoinOptions {
    /// Fully connected swarm without plugins
    pub fn new(topic: Topic, peer_id: PeerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            topic,
            peer_id,
            topology: Arc::new(FullyConnected),
            transport,
            plugins: Vec::new(),
        }
    }

    pub fn with_topology(mut self, topology: impl Topology + 'static) -> Self {
        self.topology = Arc::new(topology);
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<Plugin>) -> Self {
        self.plugins.push(plugin.into());
        self
    }
}

/// Handle to a joined swarm
#[derive(Clone)]
pub struct SwarmHandle {
    topic: Topic,
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SwarmEvent>,
}

impl SwarmHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Subscribe to lifecycle events from now on
    pub fn events(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Whether the swarm task has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Known peers and their connection states
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, SwarmError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connections(tx))
            .map_err(|_| SwarmError::Closed)?;
        rx.await.map_err(|_| SwarmError::Closed)
    }

    /// Peers with an established connection
    pub async fn connected_peers(&self) -> Result<BTreeSet<PeerId>, SwarmError> {
        Ok(self
            .connections()
            .await?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.peer_id)
            .collect())
    }

    pub async fn known_peers(&self) -> Result<BTreeSet<PeerId>, SwarmError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::KnownPeers(tx))
            .map_err(|_| SwarmError::Closed)?;
        rx.await.map_err(|_| SwarmError::Closed)
    }

    async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Joins and leaves swarms over one signal channel
pub struct NetworkManager {
    signal: Arc<dyn SignalChannel>,
    config: SwarmConfig,
    swarms: Mutex<HashMap<Topic, SwarmHandle>>,
}

impl NetworkManager {
    pub fn new(signal: Arc<dyn SignalChannel>) -> Self {
        Self::with_config(signal, SwarmConfig::default())
    }

    pub fn with_config(signal: Arc<dyn SignalChannel>, config: SwarmConfig) -> Self {
        Self {
            signal,
            config,
            swarms: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Join a swarm
    ///
    /// Returns once the signal subscription is active. Fails with
    /// [`SwarmError::AlreadyJoined`] if this manager already has the topic.
    pub async fn join_swarm(&self, options: JoinOptions) -> Result<SwarmHandle, SwarmError> {
        let mut swarms = self.swarms.lock().await;
        if let Some(existing) = swarms.get(&options.topic) {
            if !existing.is_closed() {
                return Err(SwarmError::AlreadyJoined(options.topic));
            }
        }

        let subscription = self.signal.subscribe(options.topic, options.peer_id).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let link = SwarmLink {
            commands: commands_tx.downgrade(),
        };

        let swarm_context = SwarmContext {
            topic: options.topic,
            local: options.peer_id,
            swarm: link.clone(),
        };
        for plugin in &options.plugins {
            plugin.start(&swarm_context);
        }

        let actor = SwarmActor {
            topic: options.topic,
            peer_id: options.peer_id,
            topology: options.topology,
            transport: options.transport,
            signal: self.signal.clone(),
            plugins: options.plugins,
            config: self.config.clone(),
            link,
            events: events.clone(),
            known: BTreeSet::new(),
            last_heard: HashMap::new(),
            departed: HashMap::new(),
            connections: HashMap::new(),
            next_attempt: 0,
        };
        tokio::spawn(actor.run(subscription, commands_rx));

        let handle = SwarmHandle {
            topic: options.topic,
            peer_id: options.peer_id,
            commands: commands_tx,
            events,
        };
        swarms.insert(options.topic, handle.clone());
        info!("joined swarm {} as {}", options.topic.short(), options.peer_id.short());
        Ok(handle)
    }

    /// Leave a swarm; no-op if not joined
    ///
    /// Returns after connections are closed and the signal subscription
    /// is released.
    pub async fn leave_swarm(&self, topic: &Topic) {
        let handle = self.swarms.lock().await.remove(topic);
        if let Some(handle) = handle {
            handle.leave().await;
            info!("left swarm {}", topic.short());
        }
    }

    pub async fn swarm(&self, topic: &Topic) -> Option<SwarmHandle> {
        self.swarms.lock().await.get(topic).cloned()
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.swarms.lock().await.keys().copied().collect()
    }

    /// Leave every joined swarm
    pub async fn destroy(&self) {
        let handles: Vec<SwarmHandle> = self.swarms.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.leave().await;
        }
    }
}

struct Connection {
    attempt: u64,
    direction: Direction,
    state: ConnectionState,
    /// Handshake payloads for the attempt in progress
    signals: Option<mpsc::UnboundedSender<SignalPayload>>,
    /// Connect task, then reader task once established
    task: JoinHandle<()>,
    stream: Option<Arc<dyn DuplexStream>>,
    contexts: Vec<ExtensionContext>,
}

struct SwarmActor {
    topic: Topic,
    peer_id: PeerId,
    topology: Arc<dyn Topology>,
    transport: Arc<dyn Transport>,
    signal: Arc<dyn SignalChannel>,
    plugins: Vec<Plugin>,
    config: SwarmConfig,
    link: SwarmLink,
    events: broadcast::Sender<SwarmEvent>,
    known: BTreeSet<PeerId>,
    /// Last signal message seen from each known peer
    last_heard: HashMap<PeerId, Instant>,
    /// Peers that left or expired, kept out of gossip for one expiry period
    departed: HashMap<PeerId, Instant>,
    connections: HashMap<PeerId, Connection>,
    next_attempt: u64,
}

impl SwarmActor {
    async fn run(mut self, mut subscription: Subscription, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.publish(None, SignalPayload::Announce).await;

        let mut announce = tokio::time::interval(self.config.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        announce.tick().await;

        let mut signal_open = true;
        let done = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave(done)) => break Some(done),
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                message = subscription.recv(), if signal_open => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        warn!("signal subscription for {} ended", self.topic.short());
                        signal_open = false;
                    }
                },
                _ = announce.tick() => {
                    self.publish(None, SignalPayload::Announce).await;
                    self.expire_silent().await;
                    self.reevaluate().await;
                }
            }
        };

        // Handles report closed from here on
        drop(commands);
        self.shutdown(subscription).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn shutdown(&mut self, subscription: Subscription) {
        self.publish(None, SignalPayload::Leave).await;
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer_id in peers {
            self.drop_connection(&peer_id, "leaving").await;
        }
        for plugin in &self.plugins {
            plugin.stop();
        }
        subscription.unsubscribe();
        debug!("swarm {} actor stopped", self.topic.short());
    }

    async fn publish(&self, recipient: Option<PeerId>, payload: SignalPayload) {
        let message = match recipient {
            Some(recipient) => SignalMessage::directed(self.topic, self.peer_id, recipient, payload),
            None => SignalMessage::broadcast(self.topic, self.peer_id, payload),
        };
        if let Err(e) = self.signal.publish(message).await {
            warn!("signal publish on {} failed: {}", self.topic.short(), e);
        }
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }

    /// Add a peer to the known set; true if it was new
    fn learn(&mut self, peer_id: PeerId) -> bool {
        if peer_id == self.peer_id || !self.known.insert(peer_id) {
            return false;
        }
        self.last_heard.entry(peer_id).or_insert_with(Instant::now);
        debug!("{} discovered {} on {}", self.peer_id.short(), peer_id.short(), self.topic.short());
        self.emit(SwarmEvent::PeerDiscovered(peer_id));
        true
    }

    fn heard(&mut self, peer_id: PeerId) {
        self.last_heard.insert(peer_id, Instant::now());
        self.departed.remove(&peer_id);
    }

    fn recently_departed(&self, peer_id: &PeerId) -> bool {
        self.departed
            .get(peer_id)
            .is_some_and(|at| at.elapsed() < self.config.peer_expiry())
    }

    /// Remove a peer from the known set and close anything open with it
    async fn forget(&mut self, peer_id: PeerId, reason: &str) {
        self.last_heard.remove(&peer_id);
        self.departed.insert(peer_id, Instant::now());
        if self.known.remove(&peer_id) {
            self.emit(SwarmEvent::PeerLeft(peer_id));
        }
        self.drop_connection(&peer_id, reason).await;
    }

    /// Forget unconnected peers that have not been heard from in a while
    async fn expire_silent(&mut self) {
        let expiry = self.config.peer_expiry();
        self.departed.retain(|_, at| at.elapsed() < expiry);

        let silent: Vec<PeerId> = self
            .known
            .iter()
            .filter(|peer_id| {
                let connected = self
                    .connections
                    .get(*peer_id)
                    .is_some_and(|c| c.state == ConnectionState::Connected);
                let quiet = self.last_heard.get(*peer_id).map_or(true, |at| at.elapsed() >= expiry);
                !connected && quiet
            })
            .copied()
            .collect();
        for peer_id in silent {
            info!(
                "{} forgetting {} on {}: silent for {:?}",
                self.peer_id.short(),
                peer_id.short(),
                self.topic.short(),
                expiry
            );
            self.forget(peer_id, "expired").await;
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        if message.topic != self.topic || !message.is_for(&self.peer_id) {
            return;
        }
        let from = message.author;
        trace!("{} <- {}: {:?}", self.peer_id.short(), from.short(), message.payload);
        if !matches!(message.payload, SignalPayload::Leave) {
            self.heard(from);
        }

        match message.payload {
            SignalPayload::Announce => {
                if self.learn(from) {
                    // Reply so the newcomer learns about us without waiting a full interval
                    if message.recipient.is_none() {
                        self.publish(Some(from), SignalPayload::Announce).await;
                    }
                    self.reevaluate().await;
                }
            }
            SignalPayload::Leave => {
                self.forget(from, "peer left").await;
                self.reevaluate().await;
            }
            SignalPayload::ConnectRequest => {
                self.learn(from);
                if !self.connections.contains_key(&from) {
                    self.start_connect(from, Direction::Outbound, None);
                }
            }
            payload @ SignalPayload::Offer { .. } => self.handle_offer(from, payload).await,
            payload => {
                let forwarded = self
                    .connections
                    .get(&from)
                    .and_then(|c| c.signals.as_ref())
                    .map(|tx| tx.send(payload).is_ok())
                    .unwrap_or(false);
                if !forwarded {
                    trace!("dropping stray handshake from {}", from.short());
                }
            }
        }
    }

    async fn handle_offer(&mut self, from: PeerId, offer: SignalPayload) {
        self.learn(from);
        if let Some(existing) = self.connections.get(&from) {
            let colliding = existing.state == ConnectionState::Connecting
                && existing.direction == Direction::Outbound;
            if colliding && is_initiator(&self.peer_id, &from) {
                debug!("{} ignoring colliding offer from {}", self.peer_id.short(), from.short());
                return;
            }
            // A fresh offer supersedes whatever we had with this peer
            self.drop_connection(&from, "superseded by offer").await;
        }
        self.start_connect(from, Direction::Inbound, Some(offer));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Leave(_) => {}
            Command::Connections(reply) => {
                let _ = reply.send(self.connection_infos());
            }
            Command::KnownPeers(reply) => {
                let _ = reply.send(self.known.clone());
            }
            Command::Discover(peers) => {
                let mut changed = false;
                for peer_id in peers {
                    if self.recently_departed(&peer_id) {
                        trace!("{} ignoring gossip about departed {}", self.peer_id.short(), peer_id.short());
                        continue;
                    }
                    changed |= self.learn(peer_id);
                }
                if changed {
                    self.reevaluate().await;
                }
            }
            Command::Reevaluate => self.reevaluate().await,
            Command::ConnectSucceeded {
                peer_id,
                attempt,
                stream,
            } => self.on_connected(peer_id, attempt, stream).await,
            Command::ConnectFailed {
                peer_id,
                attempt,
                error,
            } => {
                if self.connections.get(&peer_id).map(|c| c.attempt) != Some(attempt) {
                    return;
                }
                self.connections.remove(&peer_id);
                warn!("{} failed to connect to {}: {}", self.peer_id.short(), peer_id.short(), error);
                self.emit(SwarmEvent::ConnectFailed {
                    peer_id,
                    reason: error.to_string(),
                });
                self.schedule_reevaluate();
            }
            Command::Frame {
                peer_id,
                attempt,
                data,
            } => self.on_frame(peer_id, attempt, &data),
            Command::StreamClosed { peer_id, attempt } => {
                if self.connections.get(&peer_id).map(|c| c.attempt) == Some(attempt) {
                    self.drop_connection(&peer_id, "stream closed").await;
                    self.schedule_reevaluate();
                }
            }
        }
    }

    fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.known
            .iter()
            .chain(self.connections.keys().filter(|p| !self.known.contains(*p)))
            .map(|peer_id| match self.connections.get(peer_id) {
                Some(c) => ConnectionInfo {
                    peer_id: *peer_id,
                    state: c.state,
                    direction: Some(c.direction),
                },
                None => ConnectionInfo {
                    peer_id: *peer_id,
                    state: ConnectionState::Discovered,
                    direction: None,
                },
            })
            .collect()
    }

    async fn reevaluate(&mut self) {
        let targets = self.topology.compute_targets(&self.known, &self.peer_id);

        for peer_id in &targets {
            if *peer_id == self.peer_id || self.connections.contains_key(peer_id) {
                continue;
            }
            if is_initiator(&self.peer_id, peer_id) {
                self.start_connect(*peer_id, Direction::Outbound, None);
            } else {
                self.publish(Some(*peer_id), SignalPayload::ConnectRequest).await;
            }
        }

        let unwanted: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|(p, c)| c.direction == Direction::Outbound && !targets.contains(*p))
            .map(|(p, _)| *p)
            .collect();
        for peer_id in unwanted {
            self.drop_connection(&peer_id, "no longer a target").await;
        }
    }

    fn schedule_reevaluate(&self) {
        let link = self.link.clone();
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            link.send(Command::Reevaluate);
        });
    }

    fn start_connect(&mut self, peer_id: PeerId, direction: Direction, offer: Option<SignalPayload>) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        if let Some(offer) = offer {
            let _ = signals_tx.send(offer);
        }
        let request = ConnectRequest {
            topic: self.topic,
            local: self.peer_id,
            remote: peer_id,
            initiator: direction == Direction::Outbound,
            link: SignalLink::new(self.topic, self.peer_id, peer_id, self.signal.clone(), signals_rx),
        };

        let transport = self.transport.clone();
        let link = self.link.clone();
        let timeout = self.config.connect_timeout;
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.connect(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let command = match result {
                Ok(stream) => Command::ConnectSucceeded {
                    peer_id,
                    attempt,
                    stream: Arc::from(stream),
                },
                Err(error) => Command::ConnectFailed {
                    peer_id,
                    attempt,
                    error,
                },
            };
            link.send(command);
        });

        debug!(
            "{} connecting to {} ({:?}, {})",
            self.peer_id.short(),
            peer_id.short(),
            direction,
            self.transport.name()
        );
        self.connections.insert(
            peer_id,
            Connection {
                attempt,
                direction,
                state: ConnectionState::Connecting,
                signals: Some(signals_tx),
                task,
                stream: None,
                contexts: Vec::new(),
            },
        );
    }

    async fn on_connected(&mut self, peer_id: PeerId, attempt: u64, stream: Arc<dyn DuplexStream>) {
        let current = self.connections.get(&peer_id).map(|c| c.attempt) == Some(attempt);
        if !current {
            stream.close().await;
            return;
        }

        let contexts: Vec<ExtensionContext> = self
            .plugins
            .iter()
            .map(|p| ExtensionContext::new(self.topic, self.peer_id, p.channel(), stream.clone(), self.link.clone()))
            .collect();

        let reader = stream.clone();
        let link = self.link.clone();
        let task = tokio::spawn(async move {
            while let Some(data) = reader.recv().await {
                if !link.send(Command::Frame {
                    peer_id,
                    attempt,
                    data,
                }) {
                    return;
                }
            }
            link.send(Command::StreamClosed { peer_id, attempt });
        });

        if let Some(connection) = self.connections.get_mut(&peer_id) {
            connection.state = ConnectionState::Connected;
            connection.signals = None;
            connection.stream = Some(stream);
            connection.task = task;
            connection.contexts = contexts.clone();
        }

        info!("{} connected to {} on {}", self.peer_id.short(), peer_id.short(), self.topic.short());
        self.emit(SwarmEvent::Connected(peer_id));
        for (plugin, ctx) in self.plugins.iter().zip(contexts) {
            plugin.on_connect(ctx);
        }
    }

    fn on_frame(&self, peer_id: PeerId, attempt: u64, data: &[u8]) {
        let Some(connection) = self.connections.get(&peer_id) else {
            return;
        };
        if connection.attempt != attempt {
            return;
        }
        let (channel, body) = match parse_frame(data) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("bad frame from {}: {}", peer_id.short(), e);
                return;
            }
        };
        match self.plugins.iter().position(|p| p.channel() == channel) {
            Some(index) => self.plugins[index].on_message(&connection.contexts[index], body),
            None => trace!("no plugin for channel {:#04x} from {}", channel, peer_id.short()),
        }
    }

    async fn drop_connection(&mut self, peer_id: &PeerId, reason: &str) {
        let Some(connection) = self.connections.remove(peer_id) else {
            return;
        };
        connection.task.abort();
        if let Some(stream) = &connection.stream {
            stream.close().await;
        }
        if connection.state == ConnectionState::Connected {
            for (plugin, ctx) in self.plugins.iter().zip(&connection.contexts) {
                plugin.on_disconnect(ctx);
            }
            self.emit(SwarmEvent::Disconnected(*peer_id));
        }
        debug!("{} dropped {}: {}", self.peer_id.short(), peer_id.short(), reason);
    }
}
