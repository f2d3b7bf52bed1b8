//! Guest side of an invitation
//!
//! The guest joins the pairing swarm under its own peer id with a star
//! topology centered on the host, then walks the host through
//! introduce, authenticate and admit. The code comes from the caller through
//! [`GuestInvitation::authenticate`], which resolves once the host has
//! judged it.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::invitation::admission::AdmissionRequest;
use crate::invitation::observable::{InvitationMachine, InvitationSubscription};
use crate::invitation::protocol::{AuthStatus, GuestMessage, HostMessage};
use crate::invitation::types::{Invitation, InvitationError, InvitationState};
use crate::invitation::{until_interrupted, Interrupted};
use crate::keys::PeerId;
use crate::plugin::{ExtensionContext, Plugin, ProtocolPlugin};
use crate::protocol::CHANNEL_INVITATION;
use crate::swarm::{JoinOptions, NetworkManager};
use crate::topology::Star;
use crate::transport::Transport;

pub(crate) enum GuestInput {
    Connected(ExtensionContext),
    Message(HostMessage),
    Disconnected,
}

/// Swarm plugin feeding host traffic to the guest runner
#[derive(Clone)]
pub struct GuestExtension {
    host: PeerId,
    inputs: mpsc::UnboundedSender<GuestInput>,
}

impl ProtocolPlugin for GuestExtension {
    fn channel(&self) -> u8 {
        CHANNEL_INVITATION
    }

    fn on_connect(&self, ctx: ExtensionContext) {
        if *ctx.remote() == self.host {
            let _ = self.inputs.send(GuestInput::Connected(ctx));
        }
    }

    fn on_message(&self, ctx: &ExtensionContext, body: &[u8]) {
        if *ctx.remote() != self.host {
            return;
        }
        match HostMessage::decode(body) {
            Ok(message) => {
                let _ = self.inputs.send(GuestInput::Message(message));
            }
            Err(e) => debug!("bad invitation message from host: {}", e),
        }
    }

    fn on_disconnect(&self, ctx: &ExtensionContext) {
        if *ctx.remote() == self.host {
            let _ = self.inputs.send(GuestInput::Disconnected);
        }
    }
}

pub(crate) struct AuthRequest {
    code: String,
    respond: oneshot::Sender<Result<(), InvitationError>>,
}

/// Error describing why a finished invitation can no longer proceed
fn closed_error(machine: &InvitationMachine) -> InvitationError {
    let invitation = machine.snapshot();
    match (invitation.state, invitation.error) {
        (InvitationState::Cancelled, _) => InvitationError::Cancelled,
        (_, Some(kind)) => InvitationError::from_kind(kind, "invitation ended"),
        _ => InvitationError::TransportFailure("invitation closed".into()),
    }
}

/// Handle to an accepted invitation
pub struct GuestInvitation {
    machine: Arc<InvitationMachine>,
    peer_id: PeerId,
    auth: mpsc::UnboundedSender<AuthRequest>,
    cancel: Arc<Notify>,
    closed: watch::Receiver<bool>,
}

impl GuestInvitation {
    pub(crate) fn spawn(invitation: Invitation, deps: GuestDeps) -> Self {
        let machine = InvitationMachine::new(invitation.clone());
        let cancel = Arc::new(Notify::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        let extension = GuestExtension {
            host: invitation.host_peer_id(),
            inputs: inputs_tx,
        };
        let runner = GuestRunner {
            machine: machine.clone(),
            network: deps.network,
            transport: deps.transport,
            peer_id: deps.peer_id,
            label: deps.label,
            extension: Some(extension),
            inputs: inputs_rx,
            auth: auth_rx,
            cancel: cancel.clone(),
            deadline: Instant::now() + invitation.timeout,
            closed: closed_tx,
            host: None,
            awaiting_code: false,
            queued: VecDeque::new(),
            responder: None,
        };
        tokio::spawn(runner.run());

        Self {
            machine,
            peer_id: deps.peer_id,
            auth: auth_tx,
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

    /// Peer id the guest uses in the pairing swarm
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn subscribe(&self) -> InvitationSubscription {
        self.machine.subscribe()
    }

    /// Submit the code shown on the host
    ///
    /// May be called before the host asks for it. Resolves once the host
    /// accepts or rejects the code; a rejection with attempts left is
    /// `AuthenticationFailed` with a non-zero `remaining`, and the caller may
    /// try again.
    pub async fn authenticate(&self, code: impl Into<String>) -> Result<(), InvitationError> {
        if self.machine.is_terminal() {
            return Err(closed_error(&self.machine));
        }
        let (tx, rx) = oneshot::channel();
        self.auth
            .send(AuthRequest {
                code: code.into(),
                respond: tx,
            })
            .map_err(|_| closed_error(&self.machine))?;
        rx.await.unwrap_or_else(|_| Err(closed_error(&self.machine)))
    }

    pub fn cancel(&self) -> bool {
        let cancelled = self.machine.transition(InvitationState::Cancelled);
        self.cancel.notify_one();
        cancelled
    }

    /// Wait until the guest has left the pairing swarm
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

pub(crate) struct GuestDeps {
    pub network: Arc<NetworkManager>,
    pub transport: Arc<dyn Transport>,
    pub peer_id: PeerId,
    pub label: Option<String>,
}

struct GuestRunner {
    machine: Arc<InvitationMachine>,
    network: Arc<NetworkManager>,
    transport: Arc<dyn Transport>,
    peer_id: PeerId,
    label: Option<String>,
    extension: Option<GuestExtension>,
    inputs: mpsc::UnboundedReceiver<GuestInput>,
    auth: mpsc::UnboundedReceiver<AuthRequest>,
    cancel: Arc<Notify>,
    deadline: Instant,
    closed: watch::Sender<bool>,
    /// Live connection to the host
    host: Option<ExtensionContext>,
    /// Host is waiting for a code
    awaiting_code: bool,
    /// Codes submitted before the host asked for one
    queued: VecDeque<AuthRequest>,
    /// Caller waiting on the code currently being checked
    responder: Option<oneshot::Sender<Result<(), InvitationError>>>,
}

impl GuestRunner {
    async fn run(mut self) {
        let invitation = self.machine.snapshot();
        let swarm_key = invitation.swarm_key;
        let host_peer = invitation.host_peer_id();

        let mut options = JoinOptions::new(swarm_key, self.peer_id, self.transport.clone())
            .with_topology(Star::new(host_peer));
        if let Some(extension) = self.extension.take() {
            options = options.with_plugin(Plugin::InvitationGuest(extension));
        }

        let joined = match until_interrupted(self.network.join_swarm(options), &self.cancel, self.deadline).await {
            Ok(Ok(_)) => {
                self.machine.transition(InvitationState::Connecting);
                debug!("guest {} looking for host {}", self.peer_id.short(), host_peer.short());
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
            self.network.leave_swarm(&swarm_key).await;
        }

        let error = closed_error(&self.machine);
        self.respond(Err(error.clone()));
        self.auth.close();
        while let Some(request) = self.queued.pop_front().or_else(|| self.auth.try_recv().ok()) {
            let _ = request.respond.send(Err(error.clone()));
        }
        debug!("guest invitation {} closed in state {}", invitation.id.short(), self.machine.state());
        let _ = self.closed.send(true);
    }

    async fn serve(&mut self) {
        let mut auth_open = true;
        while !self.machine.is_terminal() {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => return,
                },
                request = self.auth.recv(), if auth_open => match request {
                    Some(request) => self.submit(request).await,
                    None => auth_open = false,
                },
                _ = self.cancel.notified() => return,
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.machine.fail(InvitationError::Expired);
                    return;
                }
            }
        }
    }

    fn respond(&mut self, result: Result<(), InvitationError>) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }

    async fn send(&self, message: GuestMessage) {
        let Some(host) = &self.host else {
            return;
        };
        match message.encode() {
            Ok(body) => {
                if let Err(e) = host.send(body).await {
                    debug!("send to host failed: {}", e);
                }
            }
            Err(e) => warn!("failed to encode guest message: {}", e),
        }
    }

    async fn submit(&mut self, request: AuthRequest) {
        if self.awaiting_code && self.responder.is_none() {
            self.send_code(request).await;
        } else {
            self.queued.push_back(request);
        }
    }

    async fn send_code(&mut self, request: AuthRequest) {
        self.awaiting_code = false;
        self.machine.transition(InvitationState::Authenticating);
        self.responder = Some(request.respond);
        self.send(GuestMessage::Authenticate { code: request.code }).await;
    }

    async fn ready_for_code(&mut self) {
        self.awaiting_code = true;
        if let Some(request) = self.queued.pop_front() {
            self.send_code(request).await;
        }
    }

    async fn admit(&mut self) {
        self.send(GuestMessage::Admit {
            request: AdmissionRequest {
                peer_id: self.peer_id,
                label: self.label.clone(),
            },
        })
        .await;
    }

    async fn handle(&mut self, input: GuestInput) {
        match input {
            GuestInput::Connected(ctx) => {
                if self.host.as_ref().is_some_and(|h| h.is_open()) {
                    warn!("ignoring second connection to host {}", ctx.remote().short());
                    return;
                }
                let invitation_id = self.machine.snapshot().id;
                self.host = Some(ctx);
                self.machine.transition(InvitationState::Connected);
                self.send(GuestMessage::Introduce {
                    invitation_id,
                    label: self.label.clone(),
                })
                .await;
            }
            GuestInput::Disconnected => {
                self.host = None;
                self.awaiting_code = false;
                if !self.machine.is_terminal() {
                    debug!("lost host connection; waiting to reconnect");
                    self.respond(Err(InvitationError::TransportFailure("host disconnected".into())));
                    self.machine.transition(InvitationState::Connecting);
                }
            }
            GuestInput::Message(message) => self.on_host_message(message).await,
        }
    }

    async fn on_host_message(&mut self, message: HostMessage) {
        match message {
            HostMessage::Introduced { auth_required, .. } => {
                self.machine.transition(InvitationState::ReadyForAuthentication);
                if auth_required {
                    self.ready_for_code().await;
                } else {
                    self.admit().await;
                }
            }
            HostMessage::AuthResult { status, remaining } => match status {
                AuthStatus::Ok | AuthStatus::NotRequired => {
                    self.respond(Ok(()));
                    self.admit().await;
                }
                AuthStatus::InvalidCode => {
                    let error = InvitationError::AuthenticationFailed { remaining };
                    self.machine.report(error.clone());
                    self.respond(Err(error));
                    self.machine.transition(InvitationState::ReadyForAuthentication);
                    self.ready_for_code().await;
                }
                AuthStatus::TooManyAttempts => {
                    let error = InvitationError::AuthenticationFailed { remaining: 0 };
                    self.respond(Err(error.clone()));
                    self.machine.fail(error);
                }
            },
            HostMessage::Admitted { credential } => {
                info!("admitted as {}", credential.subject.short());
                self.machine.update(|inv| inv.credential = Some(credential));
                self.machine.transition(InvitationState::Success);
            }
            HostMessage::Refused { reason } => {
                let error = InvitationError::AdmissionFailure(reason);
                self.respond(Err(error.clone()));
                self.machine.fail(error);
            }
            HostMessage::Failed { kind, reason } => {
                let error = InvitationError::from_kind(kind, reason);
                self.respond(Err(error.clone()));
                self.machine.fail(error);
            }
        }
    }
}
