//! Host side of an invitation
//!
//! The host joins the pairing swarm under the swarm key as its own peer id,
//! with a star topology centered on itself, and serves guests that connect:
//! - `Introduce` locks an interactive invitation to its first guest
//! - `Authenticate` checks the code; wrong codes are counted and the
//!   invitation fails once the attempt budget is spent
//! - `Admit` hands the guest to the admission store; replays return the
//!   credential issued the first time
//!
//! Interactive invitations end on success, failure, expiry or cancel.
//! Multi-use invitations admit any number of guests and end only on
//! expiry or cancel. Either way the host leaves the swarm afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::invitation::admission::{AdmissionProof, AdmissionRequest, AdmissionStore, Credential};
use crate::invitation::encoder::encode_invitation;
use crate::invitation::observable::{InvitationMachine, InvitationSubscription};
use crate::invitation::protocol::{AuthStatus, GuestMessage, HostMessage};
use crate::invitation::types::{
    AuthenticationCode, Invitation, InvitationDescriptor, InvitationError, InvitationErrorKind,
    InvitationKind, InvitationState, InvitationType,
};
use crate::invitation::{until_interrupted, Interrupted};
use crate::keys::{InvitationId, PeerId, Topic};
use crate::plugin::{ExtensionContext, Plugin, ProtocolPlugin};
use crate::protocol::CHANNEL_INVITATION;
use crate::swarm::{JoinOptions, NetworkManager};
use crate::topology::Star;
use crate::transport::Transport;

pub(crate) enum HostInput {
    Connected(ExtensionContext),
    Message(ExtensionContext, GuestMessage),
    Disconnected(PeerId),
}

/// Swarm plugin feeding guest traffic to the host runner
#[derive(Clone)]
pub struct HostExtension {
    inputs: mpsc::UnboundedSender<HostInput>,
    accepting: Arc<AtomicBool>,
}

impl ProtocolPlugin for HostExtension {
    fn channel(&self) -> u8 {
        CHANNEL_INVITATION
    }

    fn on_connect(&self, ctx: ExtensionContext) {
        let _ = self.inputs.send(HostInput::Connected(ctx));
    }

    fn on_message(&self, ctx: &ExtensionContext, body: &[u8]) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        match GuestMessage::decode(body) {
            Ok(message) => {
                let _ = self.inputs.send(HostInput::Message(ctx.clone(), message));
            }
            Err(e) => debug!("bad invitation message from {}: {}", ctx.remote().short(), e),
        }
    }

    fn on_disconnect(&self, ctx: &ExtensionContext) {
        let _ = self.inputs.send(HostInput::Disconnected(*ctx.remote()));
    }
}

/// Protocol state for the guests of one invitation
pub(crate) struct HostSession {
    machine: Arc<InvitationMachine>,
    invitation_id: InvitationId,
    invitation_type: InvitationType,
    kind: InvitationKind,
    topic: Topic,
    code: Option<AuthenticationCode>,
    max_attempts: u32,
    failed_attempts: u32,
    store: Arc<dyn AdmissionStore>,
    /// Interactive invitations serve only this guest
    guest: Option<PeerId>,
    introduced: HashMap<PeerId, Option<String>>,
    authenticated: HashSet<PeerId>,
    admitted: HashMap<PeerId, Credential>,
}

impl HostSession {
    pub fn new(
        machine: Arc<InvitationMachine>,
        code: Option<AuthenticationCode>,
        max_attempts: u32,
        store: Arc<dyn AdmissionStore>,
    ) -> Self {
        let invitation = machine.snapshot();
        Self {
            machine,
            invitation_id: invitation.id,
            invitation_type: invitation.invitation_type,
            kind: invitation.kind,
            topic: invitation.topic,
            code,
            max_attempts: max_attempts.max(1),
            failed_attempts: 0,
            store,
            guest: None,
            introduced: HashMap::new(),
            authenticated: HashSet::new(),
            admitted: HashMap::new(),
        }
    }

    fn interactive(&self) -> bool {
        self.invitation_type == InvitationType::Interactive
    }

    fn is_serving(&self, peer_id: &PeerId) -> bool {
        if self.interactive() && self.guest != Some(*peer_id) {
            return false;
        }
        self.introduced.contains_key(peer_id)
    }

    fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.failed_attempts)
    }

    /// Handle one guest message; returns the reply, if any
    pub async fn handle(&mut self, from: PeerId, message: GuestMessage) -> Option<HostMessage> {
        if self.machine.is_terminal() {
            // Admission replays are still answered after the invitation ends
            return match message {
                GuestMessage::Admit { .. } => self
                    .admitted
                    .get(&from)
                    .map(|credential| HostMessage::Admitted {
                        credential: credential.clone(),
                    }),
                _ => None,
            };
        }
        let reply = match message {
            GuestMessage::Introduce { invitation_id, label } => self.introduce(from, invitation_id, label),
            GuestMessage::Authenticate { code } => self.authenticate(from, &code),
            GuestMessage::Admit { request } => self.admit(from, request).await,
        };
        Some(reply)
    }

    fn introduce(&mut self, from: PeerId, invitation_id: InvitationId, label: Option<String>) -> HostMessage {
        if invitation_id != self.invitation_id {
            return HostMessage::Refused {
                reason: "unknown invitation".into(),
            };
        }
        if self.interactive() {
            match self.guest {
                Some(guest) if guest != from => {
                    debug!("refusing {}: invitation in use by {}", from.short(), guest.short());
                    return HostMessage::Refused {
                        reason: "invitation already in use".into(),
                    };
                }
                _ => {}
            }
            self.guest = Some(from);
            self.machine.update(|inv| inv.guest = Some(from));
            self.machine.transition(InvitationState::ReadyForAuthentication);
        }
        self.introduced.insert(from, label);
        HostMessage::Introduced {
            auth_required: self.code.is_some(),
            space: (self.kind == InvitationKind::Space).then_some(self.topic),
        }
    }

    fn authenticate(&mut self, from: PeerId, candidate: &str) -> HostMessage {
        if !self.is_serving(&from) {
            return HostMessage::Refused {
                reason: "not introduced".into(),
            };
        }
        let Some(code) = &self.code else {
            self.authenticated.insert(from);
            return HostMessage::AuthResult {
                status: AuthStatus::NotRequired,
                remaining: self.remaining(),
            };
        };
        if self.authenticated.contains(&from) {
            return HostMessage::AuthResult {
                status: AuthStatus::Ok,
                remaining: self.remaining(),
            };
        }

        self.machine.transition(InvitationState::Authenticating);
        if code.matches(candidate) {
            info!("guest {} authenticated", from.short());
            self.authenticated.insert(from);
            return HostMessage::AuthResult {
                status: AuthStatus::Ok,
                remaining: self.remaining(),
            };
        }

        self.failed_attempts += 1;
        let remaining = self.remaining();
        warn!("guest {} sent a wrong code ({} attempts left)", from.short(), remaining);
        if remaining == 0 {
            self.machine
                .fail(InvitationError::AuthenticationFailed { remaining: 0 });
            HostMessage::AuthResult {
                status: AuthStatus::TooManyAttempts,
                remaining: 0,
            }
        } else {
            self.machine
                .report(InvitationError::AuthenticationFailed { remaining });
            self.machine.transition(InvitationState::ReadyForAuthentication);
            HostMessage::AuthResult {
                status: AuthStatus::InvalidCode,
                remaining,
            }
        }
    }

    async fn admit(&mut self, from: PeerId, request: AdmissionRequest) -> HostMessage {
        if let Some(credential) = self.admitted.get(&from) {
            return HostMessage::Admitted {
                credential: credential.clone(),
            };
        }
        if !self.is_serving(&from) {
            return HostMessage::Refused {
                reason: "not introduced".into(),
            };
        }
        if self.code.is_some() && !self.authenticated.contains(&from) {
            return HostMessage::Failed {
                kind: InvitationErrorKind::AuthenticationFailed,
                reason: "not authenticated".into(),
            };
        }
        if request.peer_id != from {
            return HostMessage::Failed {
                kind: InvitationErrorKind::AdmissionFailure,
                reason: "admission request for another peer".into(),
            };
        }

        let label = request
            .label
            .or_else(|| self.introduced.get(&from).cloned().flatten());
        let proof = AdmissionProof {
            invitation_id: self.invitation_id,
            topic: self.topic,
            label,
        };
        let result = match self.kind {
            InvitationKind::Device => self.store.admit_device(&from, &proof).await,
            InvitationKind::Space => self.store.admit_space_member(&self.topic, &from, &proof).await,
        };

        match result {
            Ok(credential) => {
                info!("admitted {} into {}", from.short(), self.topic.short());
                self.admitted.insert(from, credential.clone());
                if self.interactive() {
                    let issued = credential.clone();
                    self.machine.update(|inv| inv.credential = Some(issued));
                    self.machine.transition(InvitationState::Success);
                } else {
                    self.machine.admitted(credential.clone());
                }
                HostMessage::Admitted { credential }
            }
            Err(e) => {
                let error = InvitationError::AdmissionFailure(e.to_string());
                if self.interactive() {
                    self.machine.fail(error);
                } else {
                    self.machine.report(error);
                }
                HostMessage::Failed {
                    kind: InvitationErrorKind::AdmissionFailure,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn disconnected(&mut self, peer_id: &PeerId) {
        self.introduced.remove(peer_id);
        if self.interactive() && self.guest == Some(*peer_id) && !self.machine.is_terminal() {
            if !self.authenticated.contains(peer_id) {
                self.guest = None;
                self.machine.update(|inv| inv.guest = None);
            }
            self.machine.transition(InvitationState::Connecting);
        }
        if !self.interactive() {
            self.authenticated.remove(peer_id);
        }
    }
}

/// Handle to a hosted invitation
pub struct HostInvitation {
    machine: Arc<InvitationMachine>,
    accepting: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    closed: watch::Receiver<bool>,
}

impl HostInvitation {
    /// Start hosting; the runner joins the pairing swarm in the background
    pub(crate) fn spawn(
        invitation: Invitation,
        code: Option<AuthenticationCode>,
        deps: HostDeps,
    ) -> Self {
        let machine = InvitationMachine::new(invitation.clone());
        let accepting = Arc::new(AtomicBool::new(true));
        let cancel = Arc::new(Notify::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        let extension = HostExtension {
            inputs: inputs_tx,
            accepting: accepting.clone(),
        };
        let session = HostSession::new(machine.clone(), code, deps.max_attempts, deps.store.clone());
        let runner = HostRunner {
            machine: machine.clone(),
            session,
            network: deps.network,
            transport: deps.transport,
            extension: Some(extension),
            inputs: inputs_rx,
            accepting: accepting.clone(),
            cancel: cancel.clone(),
            deadline: Instant::now() + invitation.timeout,
            close_delay: deps.close_delay,
            closed: closed_tx,
        };
        tokio::spawn(runner.run());

        Self {
            machine,
            accepting,
            cancel,
            closed: closed_rx,
        }
    }

    pub fn invitation(&self) -> Invitation {
        self.machine.snapshot()
    }

    pub fn state(&self) -> InvitationState {
        self.machine.state()
    }

    pub fn id(&self) -> InvitationId {
        self.machine.snapshot().id
    }

    /// Code to show the host's user; None for multi-use invitations
    pub fn authentication_code(&self) -> Option<String> {
        self.machine
            .snapshot()
            .authentication_code
            .map(|c| c.as_str().to_string())
    }

    pub fn descriptor(&self) -> InvitationDescriptor {
        self.machine.snapshot().descriptor()
    }

    /// Shareable string for the guest
    pub fn encode(&self) -> Result<String, InvitationError> {
        encode_invitation(&self.descriptor())
    }

    pub fn subscribe(&self) -> InvitationSubscription {
        self.machine.subscribe()
    }

    /// Cancel the invitation
    ///
    /// Takes effect immediately: the state becomes `Cancelled` and further
    /// guest messages are ignored. Returns false if it had already ended.
    pub fn cancel(&self) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let cancelled = self.machine.transition(InvitationState::Cancelled);
        self.cancel.notify_one();
        cancelled
    }

    /// Wait until the host has left the pairing swarm
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

pub(crate) struct HostDeps {
    pub network: Arc<NetworkManager>,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn AdmissionStore>,
    pub max_attempts: u32,
    pub close_delay: std::time::Duration,
}

struct HostRunner {
    machine: Arc<InvitationMachine>,
    session: HostSession,
    network: Arc<NetworkManager>,
    transport: Arc<dyn Transport>,
    extension: Option<HostExtension>,
    inputs: mpsc::UnboundedReceiver<HostInput>,
    accepting: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    deadline: Instant,
    close_delay: std::time::Duration,
    closed: watch::Sender<bool>,
}

impl HostRunner {
    async fn run(mut self) {
        let invitation = self.machine.snapshot();
        let swarm_key = invitation.swarm_key;
        let host_peer = invitation.host_peer_id();

        let mut options = JoinOptions::new(swarm_key, host_peer, self.transport.clone())
            .with_topology(Star::new(host_peer));
        if let Some(extension) = self.extension.take() {
            options = options.with_plugin(Plugin::InvitationHost(extension));
        }

        let joined = match until_interrupted(self.network.join_swarm(options), &self.cancel, self.deadline).await {
            Ok(Ok(_)) => {
                self.machine.transition(InvitationState::Connecting);
                info!("hosting invitation {} on {}", invitation.id.short(), swarm_key.short());
                true
            }
            Ok(Err(e)) => {
                self.machine.fail(e.into());
                false
            }
            Err(Interrupted::Expired) => {
                self.machine.fail(InvitationError::Expired);
                false
            }
            Err(Interrupted::Cancelled) => false,
        };

        if joined {
            self.serve().await;
            if matches!(self.machine.state(), InvitationState::Success | InvitationState::Error) {
                self.linger().await;
            }
            self.accepting.store(false, Ordering::SeqCst);
            self.network.leave_swarm(&swarm_key).await;
        }
        self.accepting.store(false, Ordering::SeqCst);
        debug!("invitation {} closed in state {}", invitation.id.short(), self.machine.state());
        let _ = self.closed.send(true);
    }

    async fn serve(&mut self) {
        while !self.machine.is_terminal() {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => return,
                },
                _ = self.cancel.notified() => return,
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.machine.fail(InvitationError::Expired);
                    return;
                }
            }
        }
    }

    /// Keep answering replays briefly so the last reply reaches the guest
    async fn linger(&mut self) {
        let until = Instant::now() + self.close_delay;
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => return,
                },
                _ = tokio::time::sleep_until(until) => return,
            }
        }
    }

    async fn handle(&mut self, input: HostInput) {
        match input {
            HostInput::Connected(ctx) => {
                debug!("guest {} connected", ctx.remote().short());
                if self.session.interactive() && self.machine.state() == InvitationState::Connecting {
                    self.machine.transition(InvitationState::Connected);
                }
            }
            HostInput::Message(ctx, message) => {
                let from = *ctx.remote();
                let Some(reply) = self.session.handle(from, message).await else {
                    return;
                };
                match reply.encode() {
                    Ok(body) => {
                        if let Err(e) = ctx.send(body).await {
                            debug!("reply to {} failed: {}", from.short(), e);
                        }
                    }
                    Err(e) => warn!("failed to encode reply: {}", e),
                }
            }
            HostInput::Disconnected(peer_id) => {
                debug!("guest {} disconnected", peer_id.short());
                self.session.disconnected(&peer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invitation::admission::MemoryAdmissionStore;
    use std::time::Duration;

    fn machine(invitation_type: InvitationType) -> Arc<InvitationMachine> {
        InvitationMachine::new(Invitation {
            id: InvitationId::random(),
            invitation_type,
            kind: InvitationKind::Device,
            topic: Topic::random(),
            swarm_key: Topic::random(),
            state: InvitationState::Init,
            authentication_code: None,
            timeout: Duration::from_secs(60),
            expires_at: u64::MAX,
            error: None,
            guest: None,
            credential: None,
        })
    }

    fn session(
        machine: &Arc<InvitationMachine>,
        code: Option<&str>,
        store: &Arc<MemoryAdmissionStore>,
    ) -> HostSession {
        machine.transition(InvitationState::Connecting);
        HostSession::new(
            machine.clone(),
            code.map(AuthenticationCode::new),
            3,
            store.clone(),
        )
    }

    fn introduce(machine: &Arc<InvitationMachine>) -> GuestMessage {
        GuestMessage::Introduce {
            invitation_id: machine.snapshot().id,
            label: None,
        }
    }

    fn admit(peer_id: PeerId) -> GuestMessage {
        GuestMessage::Admit {
            request: AdmissionRequest { peer_id, label: None },
        }
    }

    #[tokio::test]
    async fn test_admission_replay_returns_same_credential() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, Some("1234"), &store);
        let guest = PeerId::random();

        session.handle(guest, introduce(&machine)).await;
        let auth = session
            .handle(guest, GuestMessage::Authenticate { code: "1234".into() })
            .await;
        assert!(matches!(
            auth,
            Some(HostMessage::AuthResult { status: AuthStatus::Ok, .. })
        ));

        let first = session.handle(guest, admit(guest)).await.unwrap();
        assert_eq!(machine.state(), InvitationState::Success);
        let second = session.handle(guest, admit(guest)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.call_count(), 1);
        assert_eq!(store.devices(&machine.snapshot().topic), vec![guest]);
    }

    #[tokio::test]
    async fn test_second_guest_is_refused() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, Some("1234"), &store);

        let first = PeerId::random();
        let second = PeerId::random();
        session.handle(first, introduce(&machine)).await;
        let reply = session.handle(second, introduce(&machine)).await;
        assert!(matches!(reply, Some(HostMessage::Refused { .. })));
        assert_eq!(machine.snapshot().guest, Some(first));
    }

    #[tokio::test]
    async fn test_attempt_budget() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, Some("1234"), &store);
        let guest = PeerId::random();
        session.handle(guest, introduce(&machine)).await;

        for remaining in [2, 1] {
            let reply = session
                .handle(guest, GuestMessage::Authenticate { code: "0000".into() })
                .await;
            assert_eq!(
                reply,
                Some(HostMessage::AuthResult {
                    status: AuthStatus::InvalidCode,
                    remaining
                })
            );
            assert_eq!(machine.state(), InvitationState::ReadyForAuthentication);
        }
        let reply = session
            .handle(guest, GuestMessage::Authenticate { code: "0000".into() })
            .await;
        assert_eq!(
            reply,
            Some(HostMessage::AuthResult {
                status: AuthStatus::TooManyAttempts,
                remaining: 0
            })
        );
        let invitation = machine.snapshot();
        assert_eq!(invitation.state, InvitationState::Error);
        assert_eq!(invitation.error, Some(InvitationErrorKind::AuthenticationFailed));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_admit_requires_authentication() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, Some("1234"), &store);
        let guest = PeerId::random();
        session.handle(guest, introduce(&machine)).await;

        let reply = session.handle(guest, admit(guest)).await;
        assert!(matches!(
            reply,
            Some(HostMessage::Failed {
                kind: InvitationErrorKind::AuthenticationFailed,
                ..
            })
        ));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_use_admits_many_guests() {
        let machine = machine(InvitationType::MultiUse);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, None, &store);
        let mut events = machine.subscribe();

        for _ in 0..3 {
            let guest = PeerId::random();
            let intro = session.handle(guest, introduce(&machine)).await;
            assert_eq!(
                intro,
                Some(HostMessage::Introduced {
                    auth_required: false,
                    space: None
                })
            );
            let reply = session.handle(guest, admit(guest)).await;
            assert!(matches!(reply, Some(HostMessage::Admitted { .. })));
        }
        assert_eq!(machine.state(), InvitationState::Connecting);
        assert_eq!(store.devices(&machine.snapshot().topic).len(), 3);

        let admitted = std::iter::from_fn(|| events.try_recv())
            .filter(|e| matches!(e, crate::invitation::InvitationEvent::Admitted(_)))
            .count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn test_admission_failure_is_terminal_for_interactive() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let guest = PeerId::random();
        store.reject(guest);
        let mut session = session(&machine, None, &store);

        session.handle(guest, introduce(&machine)).await;
        let reply = session.handle(guest, admit(guest)).await;
        assert!(matches!(
            reply,
            Some(HostMessage::Failed {
                kind: InvitationErrorKind::AdmissionFailure,
                ..
            })
        ));
        assert_eq!(machine.snapshot().error, Some(InvitationErrorKind::AdmissionFailure));
    }

    #[tokio::test]
    async fn test_unknown_invitation_refused() {
        let machine = machine(InvitationType::Interactive);
        let store = Arc::new(MemoryAdmissionStore::new());
        let mut session = session(&machine, Some("1234"), &store);
        let reply = session
            .handle(
                PeerId::random(),
                GuestMessage::Introduce {
                    invitation_id: InvitationId::random(),
                    label: None,
                },
            )
            .await;
        assert!(matches!(reply, Some(HostMessage::Refused { .. })));
        assert_eq!(machine.state(), InvitationState::Connecting);
    }
}
