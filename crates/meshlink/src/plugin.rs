//! Protocol plugins attached to a swarm
//!
//! Plugins see every connection of the swarm they are attached to and own
//! one channel tag on it. Callbacks run on the swarm task and must not
//! block; plugins hand work to their own tasks.

use std::sync::Arc;

use crate::invitation::guest::GuestExtension;
use crate::invitation::host::HostExtension;
use crate::keys::{PeerId, Topic};
use crate::presence::PresencePlugin;
use crate::protocol::encode_frame;
use crate::swarm::SwarmLink;
use crate::transport::{DuplexStream, TransportError};

/// Swarm-wide context handed to plugins on start
#[derive(Clone)]
pub struct SwarmContext {
    pub topic: Topic,
    pub local: PeerId,
    pub swarm: SwarmLink,
}

/// A plugin's view of one connection
#[derive(Clone)]
pub struct ExtensionContext {
    topic: Topic,
    local: PeerId,
    remote: PeerId,
    channel: u8,
    stream: Arc<dyn DuplexStream>,
    swarm: SwarmLink,
}

impl ExtensionContext {
    pub(crate) fn new(
        topic: Topic,
        local: PeerId,
        channel: u8,
        stream: Arc<dyn DuplexStream>,
        swarm: SwarmLink,
    ) -> Self {
        Self {
            topic,
            local,
            remote: *stream.remote(),
            channel,
            stream,
            swarm,
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

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    /// Send a body on this plugin's channel
    pub async fn send(&self, body: Vec<u8>) -> Result<(), TransportError> {
        self.stream.send(encode_frame(self.channel, &body)).await
    }

    /// Report peers learned through this connection to the swarm
    pub fn discover(&self, peers: Vec<PeerId>) {
        self.swarm.discover(peers);
    }
}

/// Callbacks a protocol plugin implements
pub trait ProtocolPlugin: Send + Sync {
    /// Channel tag this plugin owns
    fn channel(&self) -> u8;

    fn start(&self, _swarm: &SwarmContext) {}

    fn stop(&self) {}

    fn on_connect(&self, ctx: ExtensionContext);

    fn on_message(&self, ctx: &ExtensionContext, body: &[u8]);

    fn on_disconnect(&self, ctx: &ExtensionContext);
}

/// Plugins a swarm can carry
#[derive(Clone)]
pub enum Plugin {
    Presence(PresencePlugin),
    InvitationHost(HostExtension),
    InvitationGuest(GuestExtension),
}

impl Plugin {
    fn inner(&self) -> &dyn ProtocolPlugin {
        match self {
            Plugin::Presence(p) => p,
            Plugin::InvitationHost(p) => p,
            Plugin::InvitationGuest(p) => p,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Plugin::Presence(_) => "presence",
            Plugin::InvitationHost(_) => "invitation-host",
            Plugin::InvitationGuest(_) => "invitation-guest",
        }
    }
}

impl ProtocolPlugin for Plugin {
    fn channel(&self) -> u8 {
        self.inner().channel()
    }

    fn start(&self, swarm: &SwarmContext) {
        self.inner().start(swarm)
    }

    fn stop(&self) {
        self.inner().stop()
    }

    fn on_connect(&self, ctx: ExtensionContext) {
        self.inner().on_connect(ctx)
    }

    fn on_message(&self, ctx: &ExtensionContext, body: &[u8]) {
        self.inner().on_message(ctx, body)
    }

    fn on_disconnect(&self, ctx: &ExtensionContext) {
        self.inner().on_disconnect(ctx)
    }
}

impl From<PresencePlugin> for Plugin {
    fn from(p: PresencePlugin) -> Self {
        Plugin::Presence(p)
    }
}
