//! Versioned wire encoding for [`FrostMessage`].
//!
//! Layout: `b"FRST"` magic, one version byte, then the bincode body.
//! Optional fields keep their `None`/`Some` distinction and metadata is an
//! ordered map, so the same message always encodes to the same bytes.

use super::FrostMessage;

pub const MAGIC: &[u8; 4] = b"FRST";
pub const WIRE_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 1;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Truncated message: {0} bytes")]
    Truncated(usize),

    #[error("Bad magic bytes")]
    BadMagic,

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode(msg: &FrostMessage) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(msg)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.push(WIRE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<FrostMessage, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    match bytes[MAGIC.len()] {
        WIRE_VERSION => Ok(bincode::deserialize(&bytes[HEADER_LEN..])?),
        other => Err(CodecError::UnsupportedVersion(other)),
    }
}

/// Structured encoding for audit trails.
pub fn to_json(msg: &FrostMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn from_json(json: &str) -> Result<FrostMessage, CodecError> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frostmessage::{ChainId, ProofData};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn sample() -> FrostMessage {
        FrostMessage::new(ChainId::Ethereum, ChainId::Polkadot, b"payload".to_vec(), 42)
            .with_sender(vec![1, 2, 3])
            .with_metadata("fee", "100")
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = sample()
            .with_metadata("zeta", "1")
            .with_metadata("alpha", "2");
        assert_eq!(encode(&msg).unwrap(), encode(&msg.clone()).unwrap());
    }

    #[test]
    fn test_header_checks() {
        let encoded = encode(&sample()).unwrap();
        assert_eq!(&encoded[..4], MAGIC);
        assert_eq!(encoded[4], WIRE_VERSION);

        assert!(matches!(decode(&encoded[..3]), Err(CodecError::Truncated(3))));

        let mut bad_magic = encoded.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic), Err(CodecError::BadMagic)));

        let mut future = encoded.clone();
        future[4] = 9;
        assert!(matches!(decode(&future), Err(CodecError::UnsupportedVersion(9))));

        assert!(matches!(decode(&encoded[..encoded.len() - 2]), Err(CodecError::Binary(_))));
    }

    #[test]
    fn test_json_keeps_unrecognized_chain() {
        let mut msg = sample();
        msg.destination_chain = ChainId::Unrecognized(31337);
        let json = to_json(&msg).unwrap();
        assert_eq!(from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_unrecognized_alias_of_known_chain_round_trips() {
        let mut msg = sample();
        msg.destination_chain = ChainId::Unrecognized(1);
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.destination_chain, ChainId::Ethereum);
        assert_eq!(decoded, msg);
        assert_eq!(decoded.replay_key(), msg.replay_key());
    }

    fn arb_proof() -> impl Strategy<Value = Option<ProofData>> {
        prop_oneof![
            Just(None),
            any::<Vec<u8>>().prop_map(|b| Some(ProofData::ZeroKnowledge(b))),
            any::<Vec<u8>>().prop_map(|b| Some(ProofData::SignatureAttestation(b))),
            any::<Vec<u8>>().prop_map(|b| Some(ProofData::Inclusion(b))),
        ]
    }

    fn arb_chain() -> impl Strategy<Value = ChainId> {
        prop_oneof![
            any::<u32>().prop_map(ChainId::from_tag),
            any::<u32>().prop_map(ChainId::Unrecognized),
            (1u32..=7).prop_map(ChainId::Unrecognized),
        ]
    }

    prop_compose! {
        fn arb_message()(
            id in any::<u128>(),
            source_chain in arb_chain(),
            destination_chain in arb_chain(),
            payload in any::<Vec<u8>>(),
            proof in arb_proof(),
            timestamp in any::<u64>(),
            nonce in any::<u64>(),
            sender in proptest::option::of(any::<Vec<u8>>()),
            recipient in proptest::option::of(any::<Vec<u8>>()),
            metadata in proptest::option::of(proptest::collection::btree_map(".*", ".*", 0..4)),
        ) -> FrostMessage {
            FrostMessage {
                id: Uuid::from_u128(id),
                source_chain,
                destination_chain,
                payload,
                proof,
                timestamp,
                nonce,
                sender,
                recipient,
                metadata,
            }
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_lossless(msg in arb_message()) {
            let decoded = decode(&encode(&msg).unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
