//! Observable invitation state
//!
//! Every state change and error is appended to a history and fanned out to
//! subscribers under one lock, so all observers see the same ordered
//! sequence. Late subscribers get the history replayed first. Once the
//! invitation reaches a terminal state the subscriber streams end.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::invitation::admission::Credential;
use crate::invitation::types::{Invitation, InvitationError, InvitationState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationEvent {
    /// Snapshot after a state change
    State(Invitation),
    /// An error; terminal errors are followed by a `State` with `Error`
    Error(InvitationError),
    /// A guest of a multi-use invitation was admitted
    Admitted(Credential),
}

struct Inner {
    invitation: Invitation,
    history: Vec<InvitationEvent>,
    subscribers: Vec<mpsc::UnboundedSender<InvitationEvent>>,
}

impl Inner {
    fn push(&mut self, event: InvitationEvent) {
        self.history.push(event.clone());
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish_if_terminal(&mut self) {
        if self.invitation.state.is_terminal() {
            self.subscribers.clear();
        }
    }
}

/// State machine shared between an invitation's runner and its handles
pub(crate) struct InvitationMachine {
    inner: Mutex<Inner>,
}

impl InvitationMachine {
    pub fn new(invitation: Invitation) -> Arc<Self> {
        let initial = InvitationEvent::State(invitation.clone());
        Arc::new(Self {
            inner: Mutex::new(Inner {
                invitation,
                history: vec![initial],
                subscribers: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Invitation {
        self.lock().invitation.clone()
    }

    pub fn state(&self) -> InvitationState {
        self.lock().invitation.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move to `next` if the step is legal; emits a `State` event
    pub fn transition(&self, next: InvitationState) -> bool {
        let mut inner = self.lock();
        let current = inner.invitation.state;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            warn!("ignoring invitation transition {} -> {}", current, next);
            return false;
        }
        debug!("invitation {} {} -> {}", inner.invitation.id.short(), current, next);
        inner.invitation.state = next;
        let snapshot = inner.invitation.clone();
        inner.push(InvitationEvent::State(snapshot));
        inner.finish_if_terminal();
        true
    }

    /// Terminal failure: emits the error, then the `Error` state
    pub fn fail(&self, error: InvitationError) -> bool {
        let mut inner = self.lock();
        if inner.invitation.state.is_terminal() {
            return false;
        }
        debug!("invitation {} failed: {}", inner.invitation.id.short(), error);
        inner.invitation.error = Some(error.kind());
        inner.push(InvitationEvent::Error(error));
        inner.invitation.state = InvitationState::Error;
        let snapshot = inner.invitation.clone();
        inner.push(InvitationEvent::State(snapshot));
        inner.finish_if_terminal();
        true
    }

    /// Non-terminal error, such as a rejected code with attempts left
    pub fn report(&self, error: InvitationError) {
        let mut inner = self.lock();
        if !inner.invitation.state.is_terminal() {
            inner.push(InvitationEvent::Error(error));
        }
    }

    pub fn admitted(&self, credential: Credential) {
        let mut inner = self.lock();
        if !inner.invitation.state.is_terminal() {
            inner.push(InvitationEvent::Admitted(credential));
        }
    }

    /// Change fields other than the state without emitting
    pub fn update(&self, f: impl FnOnce(&mut Invitation)) {
        let mut inner = self.lock();
        let state = inner.invitation.state;
        f(&mut inner.invitation);
        inner.invitation.state = state;
    }

    pub fn subscribe(&self) -> InvitationSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for event in &inner.history {
            let _ = tx.send(event.clone());
        }
        if !inner.invitation.state.is_terminal() {
            inner.subscribers.push(tx);
        }
        InvitationSubscription { rx }
    }
}

/// Ordered stream of invitation events
///
/// Starts with the history so far. Dropping it unsubscribes.
pub struct InvitationSubscription {
    rx: mpsc::UnboundedReceiver<InvitationEvent>,
}

impl InvitationSubscription {
    /// Next event, or None after the terminal state has been delivered
    pub async fn recv(&mut self) -> Option<InvitationEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InvitationEvent> {
        self.rx.try_recv().ok()
    }

    /// Skip events until the invitation reaches `state`
    pub async fn wait_for(&mut self, state: InvitationState) -> Option<Invitation> {
        while let Some(event) = self.recv().await {
            if let InvitationEvent::State(invitation) = event {
                if invitation.state == state {
                    return Some(invitation);
                }
            }
        }
        None
    }

    /// Drain until the stream ends and return the last snapshot
    pub async fn wait_terminal(&mut self) -> Option<Invitation> {
        let mut last = None;
        while let Some(event) = self.recv().await {
            if let InvitationEvent::State(invitation) = event {
                last = Some(invitation);
            }
        }
        last
    }

    /// States seen so far without waiting
    pub fn drain_states(&mut self) -> Vec<InvitationState> {
        let mut states = Vec::new();
        while let Some(event) = self.try_recv() {
            if let InvitationEvent::State(invitation) = event {
                states.push(invitation.state);
            }
        }
        states
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invitation::types::{InvitationErrorKind, InvitationKind, InvitationType};
    use crate::keys::{InvitationId, Topic};
    use std::time::Duration;
    use InvitationState::*;

    fn invitation() -> Invitation {
        Invitation {
            id: InvitationId::random(),
            invitation_type: InvitationType::Interactive,
            kind: InvitationKind::Device,
            topic: Topic::random(),
            swarm_key: Topic::random(),
            state: Init,
            authentication_code: None,
            timeout: Duration::from_secs(60),
            expires_at: 0,
            error: None,
            guest: None,
            credential: None,
        }
    }

    #[tokio::test]
    async fn test_illegal_transition_is_ignored() {
        let machine = InvitationMachine::new(invitation());
        assert!(!machine.transition(Success));
        assert_eq!(machine.state(), Init);
        assert!(machine.transition(Connecting));
        assert!(!machine.transition(Init));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history() {
        let machine = InvitationMachine::new(invitation());
        machine.transition(Connecting);
        machine.transition(Connected);

        let mut sub = machine.subscribe();
        assert_eq!(sub.drain_states(), vec![Init, Connecting, Connected]);
    }

    #[tokio::test]
    async fn test_fail_emits_error_then_state_and_ends_stream() {
        let machine = InvitationMachine::new(invitation());
        let mut sub = machine.subscribe();
        machine.transition(Connecting);
        assert!(machine.fail(InvitationError::Expired));
        assert!(!machine.fail(InvitationError::Cancelled));

        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], InvitationEvent::Error(InvitationError::Expired));
        match &events[3] {
            InvitationEvent::State(inv) => {
                assert_eq!(inv.state, Error);
                assert_eq!(inv.error, Some(InvitationErrorKind::Expired));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let machine = InvitationMachine::new(invitation());
        let mut first = machine.subscribe();
        machine.transition(Connecting);
        let mut second = machine.subscribe();
        machine.transition(ReadyForAuthentication);
        machine.report(InvitationError::AuthenticationFailed { remaining: 2 });
        machine.transition(Authenticating);
        machine.transition(Success);

        let a = first.wait_terminal().await.unwrap();
        let b = second.wait_terminal().await.unwrap();
        assert_eq!(a.state, Success);
        assert_eq!(a, b);

        let mut late = machine.subscribe();
        assert_eq!(
            late.drain_states(),
            vec![Init, Connecting, ReadyForAuthentication, Authenticating, Success]
        );
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_state() {
        let machine = InvitationMachine::new(invitation());
        let guest = crate::keys::PeerId::random();
        machine.update(|inv| {
            inv.guest = Some(guest);
            inv.state = Success;
        });
        assert_eq!(machine.state(), Init);
        assert_eq!(machine.snapshot().guest, Some(guest));
    }
}
