//! Device and space invitations
//!
//! A host creates an invitation, shares its encoded descriptor with a guest
//! and, for interactive invitations, shows a short code to its user. Both
//! sides meet in a pairing swarm keyed by the invitation's swarm key, the
//! guest proves it knows the code, and the host admits it through an
//! [`AdmissionStore`].

pub mod admission;
pub mod encoder;
pub mod guest;
pub mod handler;
pub mod host;
pub mod observable;
pub mod protocol;
pub mod types;

use std::future::Future;
use tokio::sync::Notify;
use tokio::time::Instant;

pub use admission::{AdmissionError, AdmissionProof, AdmissionRequest, AdmissionStore, Credential, MemoryAdmissionStore};
pub use encoder::{decode_invitation, encode_invitation};
pub use guest::GuestInvitation;
pub use handler::{GuestOptions, InvitationOptions, InvitationsHandler};
pub use host::HostInvitation;
pub use observable::{InvitationEvent, InvitationSubscription};
pub use types::{
    AuthenticationCode, Invitation, InvitationConfig, InvitationDescriptor, InvitationError,
    InvitationErrorKind, InvitationKind, InvitationState, InvitationType,
};

pub(crate) enum Interrupted {
    Cancelled,
    Expired,
}

/// Run `future` unless the invitation is cancelled or its deadline passes
pub(crate) async fn until_interrupted<F: Future>(
    future: F,
    cancel: &Notify,
    deadline: Instant,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        output = future => Ok(output),
        _ = cancel.notified() => Err(Interrupted::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupted::Expired),
    }
}
