//! Swarms over the WebSocket signal server and TCP transport

use meshlink::{
    GuestOptions, InvitationConfig, InvitationOptions, InvitationState, InvitationsHandler,
    JoinOptions, MemoryAdmissionStore, NetworkManager, PeerId, PresenceConfig, PresencePlugin,
    SignalServer, SwarmConfig, TcpTransport, TcpTransportConfig, Topic, WebSocketSignalChannel,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(15);

fn fast_config() -> SwarmConfig {
    SwarmConfig {
        announce_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(100),
        event_capacity: 256,
        peer_expiry_intervals: 3,
    }
}

async fn network(server: &SignalServer) -> Arc<NetworkManager> {
    let channel = WebSocketSignalChannel::connect(&server.url()).await.unwrap();
    Arc::new(NetworkManager::with_config(Arc::new(channel), fast_config()))
}

#[tokio::test]
async fn test_presence_over_websocket_and_tcp() {
    let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
    let topic = Topic::random();
    let transport = Arc::new(TcpTransport::new(TcpTransportConfig::default()));

    let mut peers = Vec::new();
    for _ in 0..2 {
        let network = network(&server).await;
        let peer_id = PeerId::random();
        let presence = PresencePlugin::new(
            peer_id,
            PresenceConfig {
                heartbeat_interval: Duration::from_millis(100),
                missed_beats_threshold: 3,
            },
        );
        let swarm = network
            .join_swarm(JoinOptions::new(topic, peer_id, transport.clone()).with_plugin(presence.clone()))
            .await
            .unwrap();
        peers.push((network, swarm, presence));
    }

    let a_id = *peers[0].1.peer_id();
    let b_id = *peers[1].1.peer_id();
    tokio::time::timeout(WAIT, peers[0].2.wait_for(|p| p.contains(&b_id)))
        .await
        .expect("a never saw b");
    tokio::time::timeout(WAIT, peers[1].2.wait_for(|p| p.contains(&a_id)))
        .await
        .expect("b never saw a");
    assert_eq!(peers[0].1.connected_peers().await.unwrap(), BTreeSet::from([b_id]));

    peers[1].0.leave_swarm(&topic).await;
    tokio::time::timeout(WAIT, peers[0].2.wait_for(|p| p.is_empty()))
        .await
        .expect("b still present after leaving");

    peers[0].0.destroy().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_pairing_over_websocket_and_tcp() {
    let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
    let transport = Arc::new(TcpTransport::new(TcpTransportConfig::default()));
    let store = Arc::new(MemoryAdmissionStore::new());
    let config = InvitationConfig {
        close_delay: Duration::from_millis(50),
        ..InvitationConfig::default()
    };

    let host_handler = InvitationsHandler::new(network(&server).await, transport.clone(), store.clone(), config.clone());
    let guest_handler = InvitationsHandler::new(
        network(&server).await,
        transport,
        Arc::new(MemoryAdmissionStore::new()),
        config,
    );

    let identity = Topic::random();
    let host = host_handler.create_invitation(InvitationOptions::device(identity));
    let code = host.authentication_code().unwrap();
    let guest = guest_handler
        .accept_encoded(&host.encode().unwrap(), GuestOptions::default())
        .unwrap();

    tokio::time::timeout(WAIT, guest.authenticate(code))
        .await
        .expect("authentication timed out")
        .unwrap();
    let mut events = guest.subscribe();
    let last = tokio::time::timeout(WAIT, events.wait_terminal()).await.unwrap().unwrap();
    assert_eq!(last.state, InvitationState::Success);
    assert_eq!(store.devices(&identity), vec![*guest.peer_id()]);

    tokio::time::timeout(WAIT, host.closed()).await.unwrap();
    tokio::time::timeout(WAIT, guest.closed()).await.unwrap();
    server.shutdown().await;
}
