//! Messages exchanged between invitation guest and host
//!
//! Carried on the invitation channel of the pairing swarm connection:
//! guest `Introduce` -> host `Introduced`, guest `Authenticate` -> host
//! `AuthResult` (repeated on wrong codes), guest `Admit` -> host `Admitted`.

use serde::{Deserialize, Serialize};

use crate::invitation::admission::{AdmissionRequest, Credential};
use crate::invitation::types::InvitationErrorKind;
use crate::keys::{InvitationId, Topic};
use crate::protocol::{decode_body, encode_body, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GuestMessage {
    Introduce {
        invitation_id: InvitationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Authenticate {
        code: String,
    },
    Admit {
        request: AdmissionRequest,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthStatus {
    Ok,
    NotRequired,
    InvalidCode,
    TooManyAttempts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Introduced {
        auth_required: bool,
        /// Space the guest is being admitted into, for space invitations
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<Topic>,
    },
    AuthResult {
        status: AuthStatus,
        remaining: u32,
    },
    Admitted {
        credential: Credential,
    },
    /// The host will not serve this guest (invitation taken or unknown)
    Refused {
        reason: String,
    },
    Failed {
        kind: InvitationErrorKind,
        reason: String,
    },
}

impl GuestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_body(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(body)
    }
}

impl HostMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_body(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(body)
    }
}
