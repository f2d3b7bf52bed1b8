//! Admission of authenticated guests
//!
//! The host hands each authenticated guest to an [`AdmissionStore`], which
//! records the device or space member and returns a credential. Stores must
//! be idempotent: admitting the same peer twice yields the same credential.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

use crate::invitation::types::{unix_millis, InvitationKind};
use crate::keys::{InvitationId, PeerId, Topic};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission rejected: {0}")]
    Rejected(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Guest's admission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub peer_id: PeerId,
    /// Human-readable device name, if the guest offers one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Evidence the host attaches when admitting a guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionProof {
    pub invitation_id: InvitationId,
    /// Identity (device) or space (space) the guest joins
    pub topic: Topic,
    pub label: Option<String>,
}

/// Record of an admitted device or member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Hex SHA-256 over kind, target and subject
    pub id: String,
    pub kind: InvitationKind,
    pub subject: PeerId,
    pub target: Topic,
    pub issued_by: InvitationId,
    /// Unix milliseconds
    pub issued_at: u64,
}

impl Credential {
    pub fn issue(kind: InvitationKind, target: Topic, subject: PeerId, issued_by: InvitationId) -> Self {
        Self {
            id: credential_id(kind, &target, &subject),
            kind,
            subject,
            target,
            issued_by,
            issued_at: unix_millis(SystemTime::now()),
        }
    }
}

/// Deterministic credential id for a subject admitted into a target
pub fn credential_id(kind: InvitationKind, target: &Topic, subject: &PeerId) -> String {
    let mut hasher = Sha256::new();
    hasher.update([kind.code()]);
    hasher.update(target.as_bytes());
    hasher.update(subject.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persists admitted devices and space members
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    async fn admit_device(&self, peer_id: &PeerId, proof: &AdmissionProof) -> Result<Credential, AdmissionError>;

    async fn admit_space_member(
        &self,
        space_id: &Topic,
        peer_id: &PeerId,
        proof: &AdmissionProof,
    ) -> Result<Credential, AdmissionError>;
}

#[derive(Default)]
struct Admitted {
    devices: BTreeMap<(Topic, PeerId), Credential>,
    members: BTreeMap<(Topic, PeerId), Credential>,
    rejected: BTreeSet<PeerId>,
    calls: usize,
}

/// In-memory admission store
#[derive(Default)]
pub struct MemoryAdmissionStore {
    inner: Mutex<Admitted>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse any future admission of `peer_id`
    pub fn reject(&self, peer_id: PeerId) {
        self.lock().rejected.insert(peer_id);
    }

    /// Devices admitted into an identity
    pub fn devices(&self, identity: &Topic) -> Vec<PeerId> {
        self.lock()
            .devices
            .keys()
            .filter(|(topic, _)| topic == identity)
            .map(|(_, peer)| *peer)
            .collect()
    }

    /// Members admitted into a space
    pub fn members(&self, space_id: &Topic) -> Vec<PeerId> {
        self.lock()
            .members
            .keys()
            .filter(|(topic, _)| topic == space_id)
            .map(|(_, peer)| *peer)
            .collect()
    }

    /// Number of admission calls received, including repeats
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Admitted> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(
        &self,
        kind: InvitationKind,
        target: Topic,
        peer_id: &PeerId,
        proof: &AdmissionProof,
    ) -> Result<Credential, AdmissionError> {
        let mut inner = self.lock();
        inner.calls += 1;
        if inner.rejected.contains(peer_id) {
            return Err(AdmissionError::Rejected(format!("peer {} is not allowed", peer_id.short())));
        }
        let table = match kind {
            InvitationKind::Device => &mut inner.devices,
            InvitationKind::Space => &mut inner.members,
        };
        let credential = table
            .entry((target, *peer_id))
            .or_insert_with(|| Credential::issue(kind, target, *peer_id, proof.invitation_id));
        Ok(credential.clone())
    }
}

#[async_trait]
impl AdmissionStore for MemoryAdmissionStore {
    async fn admit_device(&self, peer_id: &PeerId, proof: &AdmissionProof) -> Result<Credential, AdmissionError> {
        self.admit(InvitationKind::Device, proof.topic, peer_id, proof)
    }

    async fn admit_space_member(
        &self,
        space_id: &Topic,
        peer_id: &PeerId,
        proof: &AdmissionProof,
    ) -> Result<Credential, AdmissionError> {
        self.admit(InvitationKind::Space, *space_id, peer_id, proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(topic: Topic) -> AdmissionProof {
        AdmissionProof {
            invitation_id: InvitationId::random(),
            topic,
            label: None,
        }
    }

    #[tokio::test]
    async fn test_admit_device_is_idempotent() {
        let store = MemoryAdmissionStore::new();
        let identity = Topic::random();
        let peer = PeerId::random();

        let first = store.admit_device(&peer, &proof(identity)).await.unwrap();
        let second = store.admit_device(&peer, &proof(identity)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.devices(&identity), vec![peer]);
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_space_members_are_per_space() {
        let store = MemoryAdmissionStore::new();
        let space_a = Topic::random();
        let space_b = Topic::random();
        let peer = PeerId::random();

        let credential = store
            .admit_space_member(&space_a, &peer, &proof(space_a))
            .await
            .unwrap();
        assert_eq!(credential.kind, InvitationKind::Space);
        assert_eq!(credential.target, space_a);
        assert_eq!(store.members(&space_a), vec![peer]);
        assert!(store.members(&space_b).is_empty());
        assert!(store.devices(&space_a).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_peer() {
        let store = MemoryAdmissionStore::new();
        let peer = PeerId::random();
        store.reject(peer);
        let result = store.admit_device(&peer, &proof(Topic::random())).await;
        assert!(matches!(result, Err(AdmissionError::Rejected(_))));
    }

    #[test]
    fn test_credential_id_is_deterministic() {
        let target = Topic::random();
        let subject = PeerId::random();
        assert_eq!(
            credential_id(InvitationKind::Device, &target, &subject),
            credential_id(InvitationKind::Device, &target, &subject)
        );
        assert_ne!(
            credential_id(InvitationKind::Device, &target, &subject),
            credential_id(InvitationKind::Space, &target, &subject)
        );
    }
}
