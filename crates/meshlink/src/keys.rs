//! Fixed-length identifiers for peers, topics and invitations
//!
//! All identifiers are 32-byte keys compared by byte equality. They render
//! as lowercase hex and order lexicographically by their bytes, which is
//! what the swarm uses to decide which side of a pair initiates.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length in bytes of every key type
pub const KEY_LENGTH: usize = 32;

/// Errors parsing a key from bytes or hex
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KeyError {
    #[error("invalid key length: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            /// Generate a random key
            pub fn random() -> Self {
                let mut bytes = [0u8; KEY_LENGTH];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                let bytes: [u8; KEY_LENGTH] = bytes
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
                Ok(Self(bytes))
            }

            pub fn from_hex(s: &str) -> Result<Self, KeyError> {
                Self::from_slice(&hex::decode(s)?)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First 8 hex characters, for logs
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = KeyError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_hex(&s)
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> Self {
                key.to_hex()
            }
        }
    };
}

key_type!(
    /// Identifier of a participating process or device (its public key)
    PeerId
);

key_type!(
    /// Identifier naming a swarm (space id, identity key or pairing swarm key)
    Topic
);

key_type!(
    /// Identifier of a single invitation
    InvitationId
);

impl PeerId {
    /// Peer id sharing the bytes of a topic
    ///
    /// Invitation hosts join their pairing swarm under the swarm key itself,
    /// so guests know whom to connect to from the descriptor alone.
    pub fn from_topic(topic: &Topic) -> Self {
        Self(topic.0)
    }
}

impl Topic {
    pub fn from_peer_id(peer_id: &PeerId) -> Self {
        Self(peer_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let peer = PeerId::random();
        let parsed: PeerId = peer.to_hex().parse().unwrap();
        assert_eq!(parsed, peer);
        assert_eq!(peer.to_string().len(), 64);
    }

    #[test]
    fn test_short() {
        let peer = PeerId::from_bytes([0xab; KEY_LENGTH]);
        assert_eq!(peer.short(), "abababab");
        assert_eq!(format!("{:?}", peer), "PeerId(abababab)");
    }

    #[test]
    fn test_invalid_length() {
        assert_eq!(
            PeerId::from_slice(&[1, 2, 3]),
            Err(KeyError::InvalidLength(3))
        );
        assert!(Topic::from_hex("zz").is_err());
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let low = PeerId::from_bytes([0x00; KEY_LENGTH]);
        let high = PeerId::from_bytes([0xff; KEY_LENGTH]);
        assert!(low < high);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let topic = Topic::from_bytes([0x11; KEY_LENGTH]);
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(KEY_LENGTH)));
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
        assert!(serde_json::from_str::<Topic>("\"abcd\"").is_err());
    }

    #[test]
    fn test_topic_peer_conversion() {
        let topic = Topic::random();
        let peer = PeerId::from_topic(&topic);
        assert_eq!(peer.as_bytes(), topic.as_bytes());
        assert_eq!(Topic::from_peer_id(&peer), topic);
    }
}
