//! Swarm simulation over in-memory signal and transport
//!
//! Every simulated peer gets its own `NetworkManager`, just like separate
//! processes would, but they share one signal routing table and one
//! transport context.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use meshlink::{
    FullyConnected, JoinOptions, MemorySignalChannel, MemorySignalContext, MemoryTransport,
    MemoryTransportContext, NetworkManager, PeerId, PresenceConfig, PresencePlugin, Star,
    SwarmConfig, SwarmEvent, SwarmHandle, Topic,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimTopology {
    FullyConnected,
    /// The first spawned peer is the center
    Star,
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of peers to spawn
    pub peer_count: usize,
    /// How long to let the swarm run before measuring
    pub duration: Duration,
    pub topology: SimTopology,
    /// Delay added to every message on a connection
    pub latency: Duration,
    pub swarm: SwarmConfig,
    pub presence: PresenceConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peer_count: 8,
            duration: Duration::from_secs(2),
            topology: SimTopology::FullyConnected,
            latency: Duration::ZERO,
            swarm: SwarmConfig {
                announce_interval: Duration::from_millis(100),
                retry_delay: Duration::from_millis(100),
                ..SwarmConfig::default()
            },
            presence: PresenceConfig {
                heartbeat_interval: Duration::from_millis(100),
                missed_beats_threshold: 3,
            },
        }
    }
}

/// Topology analysis results
#[derive(Debug, Clone, Default)]
pub struct TopologyStats {
    pub peer_count: usize,
    /// Distinct connected pairs
    pub connection_count: usize,
    pub avg_degree: f64,
    pub min_degree: usize,
    pub max_degree: usize,
    pub isolated_peers: usize,
    /// Pairs where only one side reports the connection
    pub asymmetric_pairs: usize,
    /// Every peer's presence view equals its connected neighbors
    pub presence_matches_connections: bool,
    pub degree_distribution: BTreeMap<usize, usize>,
}

/// Simulation statistics
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub discovered: usize,
    pub connections_formed: usize,
    pub connections_lost: usize,
    pub connect_failures: usize,
    pub topology: TopologyStats,
    /// Signal subscriptions still registered after every peer left
    pub leaked_subscriptions: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    discovered: AtomicUsize,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    failed: AtomicUsize,
}

struct SimPeer {
    network: NetworkManager,
    swarm: SwarmHandle,
    presence: PresencePlugin,
    events: JoinHandle<()>,
}

/// Swarm simulation
pub struct Simulation {
    config: SimConfig,
    topic: Topic,
    signals: Arc<MemorySignalContext>,
    transports: Arc<MemoryTransportContext>,
    peers: RwLock<Vec<SimPeer>>,
    counters: Arc<Counters>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            topic: Topic::random(),
            signals: MemorySignalContext::new(),
            transports: MemoryTransportContext::new(),
            peers: RwLock::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Spawn all peers, let them run, measure, then tear everything down
    pub async fn run(&self) -> Result<SimStats> {
        let started = Instant::now();
        self.spawn_peers().await?;
        tokio::time::sleep(self.config.duration).await;

        let topology = self.analyze_topology().await?;
        info!(
            "{} peers, {} connections, avg degree {:.2}",
            topology.peer_count, topology.connection_count, topology.avg_degree
        );
        self.shutdown().await;

        Ok(SimStats {
            discovered: self.counters.discovered.load(Ordering::Relaxed),
            connections_formed: self.counters.connected.load(Ordering::Relaxed),
            connections_lost: self.counters.disconnected.load(Ordering::Relaxed),
            connect_failures: self.counters.failed.load(Ordering::Relaxed),
            topology,
            leaked_subscriptions: self.signals.subscriber_count(&self.topic),
            elapsed: started.elapsed(),
        })
    }

    async fn spawn_peers(&self) -> Result<()> {
        let ids: Vec<PeerId> = (0..self.config.peer_count).map(|_| PeerId::random()).collect();
        let Some(center) = ids.first().copied() else {
            return Ok(());
        };

        let mut peers = self.peers.write().await;
        for peer_id in ids {
            let network = NetworkManager::with_config(
                Arc::new(MemorySignalChannel::new(self.signals.clone())),
                self.config.swarm.clone(),
            );
            let transport = Arc::new(MemoryTransport::new(self.transports.clone()).with_latency(self.config.latency));
            let presence = PresencePlugin::new(peer_id, self.config.presence.clone());

            let options = JoinOptions::new(self.topic, peer_id, transport).with_plugin(presence.clone());
            let options = match self.config.topology {
                SimTopology::FullyConnected => options.with_topology(FullyConnected),
                SimTopology::Star => options.with_topology(Star::new(center)),
            };
            let swarm = network
                .join_swarm(options)
                .await
                .with_context(|| format!("peer {} failed to join", peer_id.short()))?;

            let events = tokio::spawn(count_events(swarm.events(), self.counters.clone()));
            debug!("spawned peer {}", peer_id.short());
            peers.push(SimPeer {
                network,
                swarm,
                presence,
                events,
            });
        }
        Ok(())
    }

    /// Snapshot the connection graph
    pub async fn analyze_topology(&self) -> Result<TopologyStats> {
        let peers = self.peers.read().await;
        let mut graph: HashMap<PeerId, BTreeSet<PeerId>> = HashMap::new();
        let mut presence_matches = true;
        for peer in peers.iter() {
            let connected = peer.swarm.connected_peers().await?;
            if peer.presence.peers() != connected {
                presence_matches = false;
            }
            graph.insert(*peer.swarm.peer_id(), connected);
        }

        let mut pairs = BTreeSet::new();
        let mut asymmetric = 0;
        for (peer_id, neighbors) in &graph {
            for neighbor in neighbors {
                let mirrored = graph.get(neighbor).is_some_and(|n| n.contains(peer_id));
                if !mirrored {
                    asymmetric += 1;
                }
                pairs.insert((*peer_id.min(neighbor), *peer_id.max(neighbor)));
            }
        }

        let degrees: Vec<usize> = graph.values().map(|n| n.len()).collect();
        let mut degree_distribution = BTreeMap::new();
        for degree in &degrees {
            *degree_distribution.entry(*degree).or_insert(0) += 1;
        }
        let peer_count = graph.len();

        Ok(TopologyStats {
            peer_count,
            connection_count: pairs.len(),
            avg_degree: if peer_count == 0 {
                0.0
            } else {
                degrees.iter().sum::<usize>() as f64 / peer_count as f64
            },
            min_degree: degrees.iter().copied().min().unwrap_or(0),
            max_degree: degrees.iter().copied().max().unwrap_or(0),
            isolated_peers: degrees.iter().filter(|d| **d == 0).count(),
            asymmetric_pairs: asymmetric,
            presence_matches_connections: presence_matches,
            degree_distribution,
        })
    }

    /// Every peer leaves the swarm
    pub async fn shutdown(&self) {
        let peers: Vec<SimPeer> = self.peers.write().await.drain(..).collect();
        for peer in peers {
            peer.network.destroy().await;
            peer.events.abort();
        }
    }
}

async fn count_events(mut events: tokio::sync::broadcast::Receiver<SwarmEvent>, counters: Arc<Counters>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(SwarmEvent::PeerDiscovered(_)) => {
                counters.discovered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SwarmEvent::Connected(_)) => {
                counters.connected.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SwarmEvent::Disconnected(_)) => {
                counters.disconnected.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SwarmEvent::ConnectFailed { .. }) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SwarmEvent::PeerLeft(_)) => {}
            Err(RecvError::Lagged(skipped)) => debug!("event counter lagged by {}", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}
