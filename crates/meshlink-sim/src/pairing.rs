//! In-process pairing run: one host, one guest, shared memory network

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use meshlink::{
    GuestOptions, Invitation, InvitationConfig, InvitationError, InvitationOptions,
    InvitationsHandler, MemoryAdmissionStore, MemorySignalChannel, MemorySignalContext,
    MemoryTransport, MemoryTransportContext, NetworkManager, PeerId, SwarmConfig, Topic,
};

#[derive(Debug, Clone)]
pub struct PairConfig {
    /// Host code; generated when None
    pub code: Option<String>,
    /// Codes the guest tries in order; the host's code when empty
    pub guest_codes: Vec<String>,
    /// Pair into a space instead of a device identity
    pub space: bool,
    pub invitation: InvitationConfig,
    pub swarm: SwarmConfig,
    /// Upper bound on the whole run
    pub deadline: Duration,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            code: None,
            guest_codes: Vec::new(),
            space: false,
            invitation: InvitationConfig::default(),
            swarm: SwarmConfig {
                announce_interval: Duration::from_millis(100),
                retry_delay: Duration::from_millis(100),
                ..SwarmConfig::default()
            },
            deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairOutcome {
    /// Shared invitation string
    pub encoded: String,
    pub host: Invitation,
    pub guest: Invitation,
    /// Result of each code the guest submitted
    pub attempts: Vec<Result<(), InvitationError>>,
    /// Peers the host's store admitted
    pub admitted: Vec<PeerId>,
}

fn network(signals: &Arc<MemorySignalContext>, swarm: &SwarmConfig) -> Arc<NetworkManager> {
    Arc::new(NetworkManager::with_config(
        Arc::new(MemorySignalChannel::new(signals.clone())),
        swarm.clone(),
    ))
}

/// Run a full pairing and report both sides' final state
pub async fn run_pairing(config: PairConfig) -> Result<PairOutcome> {
    let signals = MemorySignalContext::new();
    let transports = MemoryTransportContext::new();
    let transport = Arc::new(MemoryTransport::new(transports));
    let store = Arc::new(MemoryAdmissionStore::new());

    let host_handler = InvitationsHandler::new(
        network(&signals, &config.swarm),
        transport.clone(),
        store.clone(),
        config.invitation.clone(),
    );
    let guest_handler = InvitationsHandler::new(
        network(&signals, &config.swarm),
        transport,
        Arc::new(MemoryAdmissionStore::new()),
        config.invitation.clone(),
    );

    let target = Topic::random();
    let mut options = if config.space {
        InvitationOptions::space(target)
    } else {
        InvitationOptions::device(target)
    };
    if let Some(code) = &config.code {
        options = options.with_code(code.clone());
    }
    let host = host_handler.create_invitation(options);
    let encoded = host.encode().context("Failed to encode invitation")?;
    info!("invitation {}", encoded);

    let guest = guest_handler
        .accept_encoded(&encoded, GuestOptions::default())
        .context("Failed to accept invitation")?;

    let codes = if config.guest_codes.is_empty() {
        host.authentication_code().into_iter().collect()
    } else {
        config.guest_codes.clone()
    };

    let run = async {
        let mut attempts = Vec::new();
        let mut finished = false;
        for code in codes {
            let result = guest.authenticate(code).await;
            finished = result.is_ok() || guest.state().is_terminal();
            attempts.push(result);
            if finished {
                break;
            }
        }
        if !finished {
            // Out of codes with attempts left
            guest.cancel();
            host.cancel();
        }
        let mut guest_events = guest.subscribe();
        guest_events.wait_terminal().await;
        let mut host_events = host.subscribe();
        host_events.wait_terminal().await;
        attempts
    };

    let attempts = match tokio::time::timeout(config.deadline, run).await {
        Ok(attempts) => attempts,
        Err(_) => {
            host.cancel();
            guest.cancel();
            anyhow::bail!("pairing did not finish within {:?}", config.deadline);
        }
    };
    host.closed().await;
    guest.closed().await;

    let admitted = if config.space {
        store.members(&target)
    } else {
        store.devices(&target)
    };
    Ok(PairOutcome {
        encoded,
        host: host.invitation(),
        guest: guest.invitation(),
        attempts,
        admitted,
    })
}
