//! Shareable invitation strings
//!
//! An invitation descriptor is TLV-encoded and wrapped in bech32 with the
//! `minvite` prefix, so it can be pasted, put in a QR code or a URL. The
//! authentication code is never part of the encoding; it travels out of band.
//!
//! TLV records (type, length, value), in ascending type order:
//! - `0` version, 1 byte
//! - `1` invitation id, 32 bytes
//! - `2` kind, 1 byte
//! - `3` invitation type, 1 byte
//! - `4` swarm key, 32 bytes
//! - `5` topic, 32 bytes
//! - `6` expiry as big-endian Unix milliseconds, 8 bytes (optional)
//!
//! Unknown record types are skipped on decode.

use std::collections::HashMap;

use crate::invitation::types::{InvitationDescriptor, InvitationError, InvitationKind, InvitationType};
use crate::keys::{InvitationId, Topic};

/// Human-readable part of encoded invitations
pub const INVITATION_HRP: &str = "minvite";

/// Optional URI-style prefix accepted on decode
pub const INVITATION_PREFIX: &str = "meshlink:";

mod tlv {
    pub const VERSION: u8 = 0;
    pub const ID: u8 = 1;
    pub const KIND: u8 = 2;
    pub const TYPE: u8 = 3;
    pub const SWARM_KEY: u8 = 4;
    pub const TOPIC: u8 = 5;
    pub const EXPIRES_AT: u8 = 6;
}

fn malformed(reason: impl Into<String>) -> InvitationError {
    InvitationError::MalformedInvitation(reason.into())
}

fn push_record(out: &mut Vec<u8>, t: u8, value: &[u8]) {
    out.push(t);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

fn parse_tlv(data: &[u8]) -> Result<HashMap<u8, Vec<u8>>, InvitationError> {
    let mut records = HashMap::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(malformed("unexpected end of data"));
        }
        let t = data[offset];
        let l = data[offset + 1] as usize;
        offset += 2;

        if offset + l > data.len() {
            return Err(malformed(format!("not enough data for type {}, need {} bytes", t, l)));
        }
        if records.insert(t, data[offset..offset + l].to_vec()).is_some() {
            return Err(malformed(format!("duplicate record type {}", t)));
        }
        offset += l;
    }

    Ok(records)
}

fn single_byte(records: &HashMap<u8, Vec<u8>>, t: u8, name: &str) -> Result<u8, InvitationError> {
    match records.get(&t).map(Vec::as_slice) {
        Some([b]) => Ok(*b),
        Some(v) => Err(malformed(format!("{} must be 1 byte, got {}", name, v.len()))),
        None => Err(malformed(format!("missing {}", name))),
    }
}

fn required<'a>(records: &'a HashMap<u8, Vec<u8>>, t: u8, name: &str) -> Result<&'a [u8], InvitationError> {
    records
        .get(&t)
        .map(Vec::as_slice)
        .ok_or_else(|| malformed(format!("missing {}", name)))
}

/// Encode a descriptor into a shareable string
pub fn encode_invitation(descriptor: &InvitationDescriptor) -> Result<String, InvitationError> {
    use bech32::{Bech32, Hrp};

    let mut data = Vec::with_capacity(128);
    push_record(&mut data, tlv::VERSION, &[descriptor.version]);
    push_record(&mut data, tlv::ID, descriptor.id.as_bytes());
    push_record(&mut data, tlv::KIND, &[descriptor.kind.code()]);
    push_record(&mut data, tlv::TYPE, &[descriptor.invitation_type.code()]);
    push_record(&mut data, tlv::SWARM_KEY, descriptor.swarm_key.as_bytes());
    push_record(&mut data, tlv::TOPIC, descriptor.topic.as_bytes());
    if let Some(expires_at) = descriptor.expires_at {
        push_record(&mut data, tlv::EXPIRES_AT, &expires_at.to_be_bytes());
    }

    let hrp = Hrp::parse(INVITATION_HRP).map_err(|e| malformed(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &data).map_err(|e| malformed(e.to_string()))
}

/// Decode a shareable string; every failure is `MalformedInvitation`
pub fn decode_invitation(encoded: &str) -> Result<InvitationDescriptor, InvitationError> {
    let encoded = encoded.trim();
    let encoded = encoded.strip_prefix(INVITATION_PREFIX).unwrap_or(encoded);

    let (hrp, data) = bech32::decode(encoded).map_err(|e| malformed(e.to_string()))?;
    if hrp.to_string() != INVITATION_HRP {
        return Err(malformed(format!("expected prefix {}, got {}", INVITATION_HRP, hrp)));
    }

    let records = parse_tlv(&data)?;

    let version = single_byte(&records, tlv::VERSION, "version")?;
    if version != InvitationDescriptor::VERSION {
        return Err(malformed(format!("unsupported version {}", version)));
    }

    let id = InvitationId::from_slice(required(&records, tlv::ID, "invitation id")?)
        .map_err(|e| malformed(format!("invitation id: {}", e)))?;
    let kind_code = single_byte(&records, tlv::KIND, "kind")?;
    let kind = InvitationKind::from_code(kind_code)
        .ok_or_else(|| malformed(format!("unknown kind {}", kind_code)))?;
    let type_code = single_byte(&records, tlv::TYPE, "invitation type")?;
    let invitation_type = InvitationType::from_code(type_code)
        .ok_or_else(|| malformed(format!("unknown invitation type {}", type_code)))?;
    let swarm_key = Topic::from_slice(required(&records, tlv::SWARM_KEY, "swarm key")?)
        .map_err(|e| malformed(format!("swarm key: {}", e)))?;
    let topic = Topic::from_slice(required(&records, tlv::TOPIC, "topic")?)
        .map_err(|e| malformed(format!("topic: {}", e)))?;

    let expires_at = match records.get(&tlv::EXPIRES_AT) {
        Some(bytes) => {
            let bytes: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| malformed("expiry must be 8 bytes"))?;
            Some(u64::from_be_bytes(bytes))
        }
        None => None,
    };

    Ok(InvitationDescriptor {
        version,
        id,
        kind,
        invitation_type,
        swarm_key,
        topic,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> InvitationDescriptor {
        InvitationDescriptor {
            version: InvitationDescriptor::VERSION,
            id: InvitationId::random(),
            kind: InvitationKind::Space,
            invitation_type: InvitationType::Interactive,
            swarm_key: Topic::random(),
            topic: Topic::random(),
            expires_at: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_encode_decode() {
        let original = descriptor();
        let encoded = encode_invitation(&original).unwrap();
        assert!(encoded.starts_with("minvite1"));
        assert_eq!(decode_invitation(&encoded).unwrap(), original);
    }

    #[test]
    fn test_without_expiry() {
        let original = InvitationDescriptor {
            expires_at: None,
            invitation_type: InvitationType::MultiUse,
            kind: InvitationKind::Device,
            ..descriptor()
        };
        let encoded = encode_invitation(&original).unwrap();
        assert_eq!(decode_invitation(&encoded).unwrap(), original);
    }

    #[test]
    fn test_prefix_and_whitespace() {
        let original = descriptor();
        let encoded = format!("  {}{}\n", INVITATION_PREFIX, encode_invitation(&original).unwrap());
        assert_eq!(decode_invitation(&encoded).unwrap(), original);
    }

    #[test]
    fn test_malformed_inputs() {
        for input in ["", "garbage", "minvite1qqqq", "npub1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq"] {
            let err = decode_invitation(input).unwrap_err();
            assert!(matches!(err, InvitationError::MalformedInvitation(_)), "{}", input);
        }
    }

    #[test]
    fn test_corrupted_checksum() {
        let mut encoded = encode_invitation(&descriptor()).unwrap();
        let last = encoded.pop().unwrap();
        encoded.push(if last == 'q' { 'p' } else { 'q' });
        assert!(matches!(
            decode_invitation(&encoded),
            Err(InvitationError::MalformedInvitation(_))
        ));
    }

    #[test]
    fn test_wrong_hrp() {
        use bech32::{Bech32, Hrp};
        let hrp = Hrp::parse("other").unwrap();
        let encoded = bech32::encode::<Bech32>(hrp, &[0, 1, 1]).unwrap();
        assert!(matches!(
            decode_invitation(&encoded),
            Err(InvitationError::MalformedInvitation(_))
        ));
    }

    #[test]
    fn test_missing_field() {
        use bech32::{Bech32, Hrp};
        let mut data = Vec::new();
        push_record(&mut data, tlv::VERSION, &[1]);
        let encoded = bech32::encode::<Bech32>(Hrp::parse(INVITATION_HRP).unwrap(), &data).unwrap();
        let err = decode_invitation(&encoded).unwrap_err();
        assert_eq!(err, InvitationError::MalformedInvitation("missing invitation id".into()));
    }

    #[test]
    fn test_unknown_records_are_skipped() {
        use bech32::{Bech32, Hrp};
        let original = descriptor();
        let encoded = encode_invitation(&original).unwrap();
        let (_, mut data) = bech32::decode(&encoded).unwrap();
        push_record(&mut data, 42, b"future");
        let extended = bech32::encode::<Bech32>(Hrp::parse(INVITATION_HRP).unwrap(), &data).unwrap();
        assert_eq!(decode_invitation(&extended).unwrap(), original);
    }

    #[test]
    fn test_payload_has_no_code_field() {
        let encoded = encode_invitation(&descriptor()).unwrap();
        let (_, data) = bech32::decode(&encoded).unwrap();
        let records = parse_tlv(&data).unwrap();
        let mut types: Vec<u8> = records.keys().copied().collect();
        types.sort();
        assert_eq!(types, vec![0, 1, 2, 3, 4, 5, 6]);
    }
}
