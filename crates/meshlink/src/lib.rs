//! Topic swarms and authenticated pairing for meshlink
//!
//! Peers meet in swarms keyed by a 32-byte topic. Discovery and connection
//! handshakes run over a [`SignalChannel`]; data flows over duplex streams
//! opened by a [`Transport`]. Protocol plugins ride on each connection,
//! such as [`PresencePlugin`] for liveness and the invitation extensions
//! used to pair devices and admit space members.
//!
//! # Overview
//!
//! - **Signal**: in-memory routing or a WebSocket signal server
//! - **Transport**: in-memory streams or length-framed TCP
//! - **Topology**: fully connected or star
//! - **Invitations**: bech32 descriptors, code authentication, admission
//!
//! # Example
//!
//! ```rust,no_run
//! use meshlink::{
//!     JoinOptions, MemorySignalChannel, MemorySignalContext, MemoryTransport,
//!     MemoryTransportContext, NetworkManager, PeerId, PresenceConfig, PresencePlugin, Topic,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signals = MemorySignalContext::new();
//!     let transports = MemoryTransportContext::new();
//!     let network = NetworkManager::new(Arc::new(MemorySignalChannel::new(signals)));
//!
//!     let peer_id = PeerId::random();
//!     let presence = PresencePlugin::new(peer_id, PresenceConfig::default());
//!     let transport = Arc::new(MemoryTransport::new(transports));
//!     let options = JoinOptions::new(Topic::random(), peer_id, transport).with_plugin(presence.clone());
//!     let swarm = network.join_swarm(options).await?;
//!
//!     println!("joined {} as {}", swarm.topic(), swarm.peer_id());
//!     network.leave_swarm(swarm.topic()).await;
//!     Ok(())
//! }
//! ```

pub mod invitation;
pub mod keys;
pub mod memory;
pub mod plugin;
pub mod presence;
pub mod protocol;
pub mod signal;
pub mod swarm;
pub mod tcp;
pub mod topology;
pub mod transport;
pub mod ws_signal;

pub use invitation::{
    decode_invitation, encode_invitation, AdmissionError, AdmissionProof, AdmissionRequest,
    AdmissionStore, AuthenticationCode, Credential, GuestInvitation, GuestOptions, HostInvitation,
    Invitation, InvitationConfig, InvitationDescriptor, InvitationError, InvitationErrorKind,
    InvitationEvent, InvitationKind, InvitationOptions, InvitationState, InvitationSubscription,
    InvitationType, InvitationsHandler, MemoryAdmissionStore,
};
pub use keys::{InvitationId, KeyError, PeerId, Topic, KEY_LENGTH};
pub use memory::{
    MemorySignalChannel, MemorySignalContext, MemoryStream, MemoryTransport, MemoryTransportContext,
};
pub use plugin::{ExtensionContext, Plugin, ProtocolPlugin, SwarmContext};
pub use presence::{Heartbeat, PresenceConfig, PresencePlugin};
pub use protocol::{ProtocolError, CHANNEL_INVITATION, CHANNEL_PRESENCE};
pub use signal::{SignalChannel, SignalError, SignalMessage, SignalPayload, Subscription};
pub use swarm::{
    is_initiator, ConnectionInfo, ConnectionState, Direction, JoinOptions, NetworkManager,
    SwarmConfig, SwarmError, SwarmEvent, SwarmHandle, SwarmLink,
};
pub use tcp::{TcpDuplex, TcpTransport, TcpTransportConfig};
pub use topology::{FullyConnected, Star, Topology};
pub use transport::{ConnectRequest, DuplexStream, SignalLink, Transport, TransportError};
pub use ws_signal::{SignalServer, WebSocketSignalChannel};
