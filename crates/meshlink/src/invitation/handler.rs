//! Entry point for creating and accepting invitations

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

use crate::invitation::admission::AdmissionStore;
use crate::invitation::encoder::decode_invitation;
use crate::invitation::guest::{GuestDeps, GuestInvitation};
use crate::invitation::host::{HostDeps, HostInvitation};
use crate::invitation::types::{
    remaining_until, unix_millis, AuthenticationCode, Invitation, InvitationConfig,
    InvitationDescriptor, InvitationError, InvitationKind, InvitationState, InvitationType,
};
use crate::keys::{InvitationId, PeerId, Topic};
use crate::swarm::NetworkManager;
use crate::transport::Transport;

/// What to invite a guest into
#[derive(Debug, Clone)]
pub struct InvitationOptions {
    pub kind: InvitationKind,
    pub invitation_type: InvitationType,
    /// Identity key (device) or space key (space)
    pub topic: Topic,
    /// Fixed code instead of a generated one (interactive only)
    pub authentication_code: Option<String>,
    pub timeout: Option<Duration>,
    /// Pairing swarm key; random when not given
    pub swarm_key: Option<Topic>,
}

impl InvitationOptions {
    /// Interactive invitation pairing a device with `identity`
    pub fn device(identity: Topic) -> Self {
        Self {
            kind: InvitationKind::Device,
            invitation_type: InvitationType::Interactive,
            topic: identity,
            authentication_code: None,
            timeout: None,
            swarm_key: None,
        }
    }

    /// Interactive invitation into a space
    pub fn space(space_id: Topic) -> Self {
        Self {
            kind: InvitationKind::Space,
            ..Self::device(space_id)
        }
    }

    pub fn multi_use(mut self) -> Self {
        self.invitation_type = InvitationType::MultiUse;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.authentication_code = Some(code.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_swarm_key(mut self, swarm_key: Topic) -> Self {
        self.swarm_key = Some(swarm_key);
        self
    }
}

/// How the guest presents itself
#[derive(Debug, Clone, Default)]
pub struct GuestOptions {
    /// Peer id in the pairing swarm; random when not given
    pub peer_id: Option<PeerId>,
    pub label: Option<String>,
}

/// Creates hosted invitations and accepts remote ones over one network
pub struct InvitationsHandler {
    network: Arc<NetworkManager>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn AdmissionStore>,
    config: InvitationConfig,
}

impl InvitationsHandler {
    pub fn new(
        network: Arc<NetworkManager>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn AdmissionStore>,
        config: InvitationConfig,
    ) -> Self {
        Self {
            network,
            transport,
            store,
            config,
        }
    }

    pub fn config(&self) -> &InvitationConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    /// Create and start hosting an invitation
    pub fn create_invitation(&self, options: InvitationOptions) -> HostInvitation {
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let code = match options.invitation_type {
            InvitationType::Interactive => Some(
                options
                    .authentication_code
                    .map(AuthenticationCode::new)
                    .unwrap_or_else(|| AuthenticationCode::generate(self.config.auth_code_length)),
            ),
            InvitationType::MultiUse => None,
        };

        let invitation = Invitation {
            id: InvitationId::random(),
            invitation_type: options.invitation_type,
            kind: options.kind,
            topic: options.topic,
            swarm_key: options.swarm_key.unwrap_or_else(Topic::random),
            state: InvitationState::Init,
            authentication_code: code.clone(),
            timeout,
            expires_at: unix_millis(SystemTime::now()).saturating_add(timeout.as_millis() as u64),
            error: None,
            guest: None,
            credential: None,
        };
        info!(
            "creating {:?} {:?} invitation {} for {}",
            invitation.invitation_type,
            invitation.kind,
            invitation.id.short(),
            invitation.topic.short()
        );

        HostInvitation::spawn(
            invitation,
            code,
            HostDeps {
                network: self.network.clone(),
                transport: self.transport.clone(),
                store: self.store.clone(),
                max_attempts: self.config.max_auth_attempts,
                close_delay: self.config.close_delay,
            },
        )
    }

    /// Accept an invitation from its descriptor
    ///
    /// The guest gives up at the earlier of the descriptor's expiry and the
    /// configured default timeout.
    pub fn accept_invitation(&self, descriptor: InvitationDescriptor, options: GuestOptions) -> GuestInvitation {
        let timeout = match descriptor.expires_at {
            Some(expires_at) => remaining_until(expires_at).min(self.config.default_timeout),
            None => self.config.default_timeout,
        };
        let invitation = Invitation {
            id: descriptor.id,
            invitation_type: descriptor.invitation_type,
            kind: descriptor.kind,
            topic: descriptor.topic,
            swarm_key: descriptor.swarm_key,
            state: InvitationState::Init,
            authentication_code: None,
            timeout,
            expires_at: unix_millis(SystemTime::now()).saturating_add(timeout.as_millis() as u64),
            error: None,
            guest: None,
            credential: None,
        };
        let peer_id = options.peer_id.unwrap_or_else(PeerId::random);
        info!("accepting invitation {} as {}", invitation.id.short(), peer_id.short());

        GuestInvitation::spawn(
            invitation,
            GuestDeps {
                network: self.network.clone(),
                transport: self.transport.clone(),
                peer_id,
                label: options.label,
            },
        )
    }

    /// Decode a shared invitation string and accept it
    pub fn accept_encoded(&self, encoded: &str, options: GuestOptions) -> Result<GuestInvitation, InvitationError> {
        let descriptor = decode_invitation(encoded)?;
        Ok(self.accept_invitation(descriptor, options))
    }
}
