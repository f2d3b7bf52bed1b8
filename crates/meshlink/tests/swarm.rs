//! Swarm integration tests over in-memory signal and transport

use meshlink::{
    ConnectionState, Direction, JoinOptions, MemorySignalChannel, MemorySignalContext,
    MemoryTransport, MemoryTransportContext, NetworkManager, PeerId, PresenceConfig,
    PresencePlugin, Star, SwarmConfig, SwarmEvent, SwarmHandle, Topic,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SwarmConfig {
    SwarmConfig {
        announce_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(50),
        event_capacity: 256,
        peer_expiry_intervals: 5,
    }
}

fn fast_presence() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_millis(50),
        missed_beats_threshold: 3,
    }
}

struct Shared {
    signals: Arc<MemorySignalContext>,
    transports: Arc<MemoryTransportContext>,
}

impl Shared {
    fn new() -> Self {
        Self {
            signals: MemorySignalContext::new(),
            transports: MemoryTransportContext::new(),
        }
    }

    fn network(&self) -> NetworkManager {
        NetworkManager::with_config(
            Arc::new(MemorySignalChannel::new(self.signals.clone())),
            fast_config(),
        )
    }

    fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(self.transports.clone()))
    }
}

struct Member {
    network: NetworkManager,
    swarm: SwarmHandle,
    presence: PresencePlugin,
}

async fn join(shared: &Shared, topic: Topic) -> Member {
    let network = shared.network();
    let peer_id = PeerId::random();
    let presence = PresencePlugin::new(peer_id, fast_presence());
    let options = JoinOptions::new(topic, peer_id, shared.transport()).with_plugin(presence.clone());
    let swarm = network.join_swarm(options).await.unwrap();
    Member {
        network,
        swarm,
        presence,
    }
}

async fn wait_connected(swarm: &SwarmHandle, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if swarm.connected_peers().await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peers did not connect in time");
}

#[tokio::test]
async fn test_presence_converges_and_follows_leave() {
    let shared = Shared::new();
    let topic = Topic::random();
    let members = vec![
        join(&shared, topic).await,
        join(&shared, topic).await,
        join(&shared, topic).await,
    ];
    let ids: Vec<PeerId> = members.iter().map(|m| *m.swarm.peer_id()).collect();

    for (i, member) in members.iter().enumerate() {
        let expected: BTreeSet<PeerId> = ids.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, p)| *p).collect();
        let seen = tokio::time::timeout(WAIT, member.presence.wait_for(|peers| *peers == expected))
            .await
            .expect("presence did not converge");
        assert_eq!(seen, expected);
    }

    // Presence is symmetric: a sees b iff b sees a
    for a in &members {
        for b in &members {
            if a.swarm.peer_id() != b.swarm.peer_id() {
                assert_eq!(
                    a.presence.has(b.swarm.peer_id()),
                    b.presence.has(a.swarm.peer_id())
                );
            }
        }
    }

    let leaving = &members[2];
    leaving.network.leave_swarm(&topic).await;
    for member in &members[..2] {
        tokio::time::timeout(WAIT, member.presence.wait_for(|peers| !peers.contains(&ids[2])))
            .await
            .expect("departed peer still present");
    }
    assert!(members[2].swarm.is_closed());
}

#[tokio::test]
async fn test_one_connection_per_pair() {
    let shared = Shared::new();
    let topic = Topic::random();
    let mut members = Vec::new();
    for _ in 0..4 {
        members.push(join(&shared, topic).await);
    }
    for member in &members {
        wait_connected(&member.swarm, 3).await;
    }
    // Let any crossed handshakes settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    for member in &members {
        let connections = member.swarm.connections().await.unwrap();
        let connected: Vec<_> = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .collect();
        assert_eq!(connected.len(), 3);
        let unique: BTreeSet<PeerId> = connected.iter().map(|c| c.peer_id).collect();
        assert_eq!(unique.len(), 3);
    }

    // Exactly one side of each pair holds the outbound end
    for a in &members {
        let a_conns = a.swarm.connections().await.unwrap();
        for b in &members {
            if a.swarm.peer_id() == b.swarm.peer_id() {
                continue;
            }
            let b_conns = b.swarm.connections().await.unwrap();
            let a_dir = a_conns.iter().find(|c| c.peer_id == *b.swarm.peer_id()).and_then(|c| c.direction);
            let b_dir = b_conns.iter().find(|c| c.peer_id == *a.swarm.peer_id()).and_then(|c| c.direction);
            assert!(a_dir.is_some() && b_dir.is_some());
            assert_ne!(a_dir, b_dir);
            assert!(a_dir == Some(Direction::Outbound) || b_dir == Some(Direction::Outbound));
        }
    }
}

#[tokio::test]
async fn test_star_topology_connects_leaves_to_center() {
    let shared = Shared::new();
    let topic = Topic::random();
    let center = PeerId::random();
    let transport = shared.transport();

    let center_net = shared.network();
    let center_swarm = center_net
        .join_swarm(JoinOptions::new(topic, center, transport.clone()).with_topology(Star::new(center)))
        .await
        .unwrap();

    let mut leaves = Vec::new();
    for _ in 0..3 {
        let network = shared.network();
        let swarm = network
            .join_swarm(JoinOptions::new(topic, PeerId::random(), transport.clone()).with_topology(Star::new(center)))
            .await
            .unwrap();
        leaves.push((network, swarm));
    }

    wait_connected(&center_swarm, 3).await;
    for (_, swarm) in &leaves {
        wait_connected(swarm, 1).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (_, swarm) in &leaves {
        let connected = swarm.connected_peers().await.unwrap();
        assert_eq!(connected, BTreeSet::from([center]));
    }
}

#[tokio::test]
async fn test_events_and_no_lingering_subscriptions() {
    let shared = Shared::new();
    let topic = Topic::random();
    let a = join(&shared, topic).await;
    let mut events = a.swarm.events();
    let b = join(&shared, topic).await;

    let b_id = *b.swarm.peer_id();
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SwarmEvent::Connected(peer)) = events.recv().await {
                if peer == b_id {
                    return;
                }
            }
        }
    })
    .await
    .expect("no connected event");

    assert_eq!(shared.signals.subscriber_count(&topic), 2);
    b.network.destroy().await;
    a.network.destroy().await;
    assert_eq!(shared.signals.subscriber_count(&topic), 0);
    assert_eq!(shared.signals.topic_count(), 0);
    assert!(a.network.topics().await.is_empty());
}
