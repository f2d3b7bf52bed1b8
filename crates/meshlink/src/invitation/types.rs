//! Invitation data model

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::invitation::admission::Credential;
use crate::keys::{InvitationId, PeerId, Topic};
use crate::swarm::SwarmError;

/// Invitation timing and authentication parameters
#[derive(Debug, Clone)]
pub struct InvitationConfig {
    /// Lifetime of an invitation when the caller does not give one
    pub default_timeout: Duration,
    /// Wrong codes accepted before the invitation fails
    pub max_auth_attempts: u32,
    /// Digits in generated authentication codes
    pub auth_code_length: usize,
    /// Grace period before leaving the pairing swarm after a terminal state
    pub close_delay: Duration,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(180),
            max_auth_attempts: 3,
            auth_code_length: 6,
            close_delay: Duration::from_millis(200),
        }
    }
}

/// What the guest is admitted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationKind {
    /// Pair a new device with the host's identity
    Device,
    /// Admit a new member into a shared space
    Space,
}

impl InvitationKind {
    pub fn code(&self) -> u8 {
        match self {
            InvitationKind::Device => 0,
            InvitationKind::Space => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InvitationKind::Device),
            1 => Some(InvitationKind::Space),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvitationType {
    /// Single guest, authenticated with a code shown to the host's user
    Interactive,
    /// Any number of guests until cancelled or expired; no code
    MultiUse,
}

impl InvitationType {
    pub fn code(&self) -> u8 {
        match self {
            InvitationType::Interactive => 0,
            InvitationType::MultiUse => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InvitationType::Interactive),
            1 => Some(InvitationType::MultiUse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationState {
    Init,
    Connecting,
    Connected,
    ReadyForAuthentication,
    Authenticating,
    Success,
    Error,
    Cancelled,
}

impl InvitationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvitationState::Success | InvitationState::Error | InvitationState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal step
    ///
    /// Any live state may fail or be cancelled. Progress otherwise runs
    /// forward, except that a lost connection returns to `Connecting` and a
    /// rejected code returns to `ReadyForAuthentication`.
    pub fn can_transition_to(&self, next: InvitationState) -> bool {
        use InvitationState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Error) | (_, Cancelled) => true,
            (Init, Connecting) => true,
            (Connecting, Connected) | (Connecting, ReadyForAuthentication) => true,
            (Connected, ReadyForAuthentication) | (Connected, Connecting) => true,
            (ReadyForAuthentication, Authenticating)
            | (ReadyForAuthentication, Success)
            | (ReadyForAuthentication, Connecting) => true,
            (Authenticating, ReadyForAuthentication)
            | (Authenticating, Success)
            | (Authenticating, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InvitationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvitationState::Init => "INIT",
            InvitationState::Connecting => "CONNECTING",
            InvitationState::Connected => "CONNECTED",
            InvitationState::ReadyForAuthentication => "READY_FOR_AUTHENTICATION",
            InvitationState::Authenticating => "AUTHENTICATING",
            InvitationState::Success => "SUCCESS",
            InvitationState::Error => "ERROR",
            InvitationState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Error category reported on the invitation and over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvitationErrorKind {
    AlreadyJoined,
    TransportFailure,
    AuthenticationFailed,
    Expired,
    Cancelled,
    MalformedInvitation,
    AdmissionFailure,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvitationError {
    #[error("Already joined swarm {0}")]
    AlreadyJoined(Topic),
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    #[error("Authentication failed ({remaining} attempts remaining)")]
    AuthenticationFailed { remaining: u32 },
    #[error("Invitation expired")]
    Expired,
    #[error("Invitation cancelled")]
    Cancelled,
    #[error("Malformed invitation: {0}")]
    MalformedInvitation(String),
    #[error("Admission failed: {0}")]
    AdmissionFailure(String),
}

impl InvitationError {
    pub fn kind(&self) -> InvitationErrorKind {
        match self {
            InvitationError::AlreadyJoined(_) => InvitationErrorKind::AlreadyJoined,
            InvitationError::TransportFailure(_) => InvitationErrorKind::TransportFailure,
            InvitationError::AuthenticationFailed { .. } => InvitationErrorKind::AuthenticationFailed,
            InvitationError::Expired => InvitationErrorKind::Expired,
            InvitationError::Cancelled => InvitationErrorKind::Cancelled,
            InvitationError::MalformedInvitation(_) => InvitationErrorKind::MalformedInvitation,
            InvitationError::AdmissionFailure(_) => InvitationErrorKind::AdmissionFailure,
        }
    }

    /// Rebuild an error from a kind received from the other side
    pub fn from_kind(kind: InvitationErrorKind, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match kind {
            InvitationErrorKind::AlreadyJoined => InvitationError::TransportFailure(reason),
            InvitationErrorKind::TransportFailure => InvitationError::TransportFailure(reason),
            InvitationErrorKind::AuthenticationFailed => {
                InvitationError::AuthenticationFailed { remaining: 0 }
            }
            InvitationErrorKind::Expired => InvitationError::Expired,
            InvitationErrorKind::Cancelled => InvitationError::Cancelled,
            InvitationErrorKind::MalformedInvitation => InvitationError::MalformedInvitation(reason),
            InvitationErrorKind::AdmissionFailure => InvitationError::AdmissionFailure(reason),
        }
    }
}

impl From<SwarmError> for InvitationError {
    fn from(e: SwarmError) -> Self {
        match e {
            SwarmError::AlreadyJoined(topic) => InvitationError::AlreadyJoined(topic),
            other => InvitationError::TransportFailure(other.to_string()),
        }
    }
}

/// Short secret shown to the host's user and typed in on the guest
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticationCode(String);

impl AuthenticationCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Random decimal code of `length` digits
    pub fn generate(length: usize) -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..length.max(1))
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a submitted code
    pub fn matches(&self, candidate: &str) -> bool {
        bool::from(self.0.as_bytes().ct_eq(candidate.as_bytes()))
    }
}

impl fmt::Debug for AuthenticationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthenticationCode(..)")
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time remaining until a Unix-millisecond deadline
pub fn remaining_until(expires_at_ms: u64) -> Duration {
    Duration::from_millis(expires_at_ms.saturating_sub(unix_millis(SystemTime::now())))
}

/// Observable snapshot of an invitation on either side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub id: InvitationId,
    pub invitation_type: InvitationType,
    pub kind: InvitationKind,
    /// Identity key (device) or space key (space) the guest is admitted into
    pub topic: Topic,
    /// Pairing swarm the host listens on
    pub swarm_key: Topic,
    pub state: InvitationState,
    /// Present on the host of an interactive invitation only
    pub authentication_code: Option<AuthenticationCode>,
    pub timeout: Duration,
    /// Unix milliseconds
    pub expires_at: u64,
    pub error: Option<InvitationErrorKind>,
    /// Guest currently being served (interactive)
    pub guest: Option<PeerId>,
    pub credential: Option<Credential>,
}

impl Invitation {
    /// Peer id the host uses in the pairing swarm
    pub fn host_peer_id(&self) -> PeerId {
        PeerId::from_topic(&self.swarm_key)
    }

    pub fn is_expired(&self) -> bool {
        unix_millis(SystemTime::now()) >= self.expires_at
    }

    pub fn descriptor(&self) -> InvitationDescriptor {
        InvitationDescriptor {
            version: InvitationDescriptor::VERSION,
            id: self.id,
            kind: self.kind,
            invitation_type: self.invitation_type,
            swarm_key: self.swarm_key,
            topic: self.topic,
            expires_at: Some(self.expires_at),
        }
    }
}

/// Shareable part of an invitation; never carries the code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationDescriptor {
    pub version: u8,
    pub id: InvitationId,
    pub kind: InvitationKind,
    pub invitation_type: InvitationType,
    pub swarm_key: Topic,
    pub topic: Topic,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl InvitationDescriptor {
    pub const VERSION: u8 = 1;

    pub fn host_peer_id(&self) -> PeerId {
        PeerId::from_topic(&self.swarm_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvitationState::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Init, Connecting, Connected, ReadyForAuthentication, Authenticating, Success];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Success, Error, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Init, Connecting, Success, Error, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_no_skipping_backwards() {
        assert!(!Connecting.can_transition_to(Init));
        assert!(!Authenticating.can_transition_to(Connected));
        assert!(!Init.can_transition_to(Success));
        assert!(Authenticating.can_transition_to(ReadyForAuthentication));
    }

    #[test]
    fn test_code_generation() {
        let code = AuthenticationCode::generate(6);
        assert_eq!(code.as_str().len(), 6);
        assert!(code.as_str().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_code_matches() {
        let code = AuthenticationCode::new("1234");
        assert!(code.matches("1234"));
        assert!(!code.matches("0000"));
        assert!(!code.matches("12345"));
        assert!(!code.matches(""));
        assert_eq!(format!("{:?}", code), "AuthenticationCode(..)");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ReadyForAuthentication.to_string(), "READY_FOR_AUTHENTICATION");
        let json = serde_json::to_string(&ReadyForAuthentication).unwrap();
        assert_eq!(json, "\"READY_FOR_AUTHENTICATION\"");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            InvitationError::AuthenticationFailed { remaining: 2 }.kind(),
            InvitationErrorKind::AuthenticationFailed
        );
        let topic = Topic::random();
        assert_eq!(
            InvitationError::from(SwarmError::AlreadyJoined(topic)),
            InvitationError::AlreadyJoined(topic)
        );
    }
}
