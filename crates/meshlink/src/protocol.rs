//! Wire framing for plugin traffic on peer connections
//!
//! Every frame on a connection is `[channel tag][msgpack body]`. The tag
//! routes the body to the plugin that owns that channel:
//! - `0x01` presence heartbeats
//! - `0x02` invitation host/guest messages
//!
//! Bodies use named (map) msgpack encoding so optional fields can be
//! omitted and added without breaking older peers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const CHANNEL_PRESENCE: u8 = 0x01;
pub const CHANNEL_INVITATION: u8 = 0x02;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Prefix a body with its channel tag
pub fn encode_frame(channel: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(channel);
    frame.extend_from_slice(body);
    frame
}

/// Split a frame into channel tag and body
pub fn parse_frame(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    match frame.split_first() {
        Some((channel, body)) => Ok((*channel, body)),
        None => Err(ProtocolError::Empty),
    }
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec_named(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}
