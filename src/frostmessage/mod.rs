//! Canonical value types exchanged between the relay and its adapters.

pub mod chain;
pub mod codec;
pub mod ids;
pub mod proof;
pub mod status;

pub use chain::ChainId;
pub use codec::{CodecError, WIRE_VERSION};
pub use ids::{BlockId, TxId};
pub use proof::{ProofData, ProofKind};
pub use status::{ChainMessageStatus, FailureReason, MessageStatus};

use std::collections::BTreeMap;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::unix_timestamp;

type Blake2b256 = Blake2b<U32>;

/// Errors raised when mutating a [`FrostMessage`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Proof already attached to message {0}")]
    ProofAlreadyAttached(Uuid),
}

/// Sender-scoped replay protection key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplayKey {
    pub sender: Option<Vec<u8>>,
    pub source_chain: ChainId,
}

impl std::fmt::Display for ReplayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sender {
            Some(sender) => write!(f, "0x{}@{}", hex::encode(sender), self.source_chain),
            None => write!(f, "anonymous@{}", self.source_chain),
        }
    }
}

/// Application-level message relayed from one chain to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrostMessage {
    pub id: Uuid,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub payload: Vec<u8>,
    pub proof: Option<ProofData>,
    pub timestamp: u64,
    pub nonce: u64,
    pub sender: Option<Vec<u8>>,
    pub recipient: Option<Vec<u8>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Everything in a message except the proof, in field order.
#[derive(Serialize)]
struct DigestView<'a> {
    id: &'a Uuid,
    source_chain: ChainId,
    destination_chain: ChainId,
    payload: &'a [u8],
    timestamp: u64,
    nonce: u64,
    sender: &'a Option<Vec<u8>>,
    recipient: &'a Option<Vec<u8>>,
    metadata: &'a Option<BTreeMap<String, String>>,
}

impl FrostMessage {
    pub fn new(
        source_chain: ChainId,
        destination_chain: ChainId,
        payload: impl Into<Vec<u8>>,
        nonce: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_chain,
            destination_chain,
            payload: payload.into(),
            proof: None,
            timestamp: unix_timestamp(),
            nonce,
            sender: None,
            recipient: None,
            metadata: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<Vec<u8>>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<Vec<u8>>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.insert_metadata(key, value);
        self
    }

    pub fn insert_metadata(&mut self, key: &str, value: &str) {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    pub fn replay_key(&self) -> ReplayKey {
        ReplayKey {
            sender: self.sender.clone(),
            source_chain: self.source_chain,
        }
    }

    /// Attaches the proof. A message carries at most one proof in its lifetime.
    pub fn attach_proof(&mut self, proof: ProofData) -> Result<(), MessageError> {
        if self.proof.is_some() {
            return Err(MessageError::ProofAlreadyAttached(self.id));
        }
        self.proof = Some(proof);
        Ok(())
    }

    /// BLAKE2b-256 over every field except the proof.
    pub fn digest(&self) -> [u8; 32] {
        let view = DigestView {
            id: &self.id,
            source_chain: self.source_chain,
            destination_chain: self.destination_chain,
            payload: &self.payload,
            timestamp: self.timestamp,
            nonce: self.nonce,
            sender: &self.sender,
            recipient: &self.recipient,
            metadata: &self.metadata,
        };
        // Serializing plain data into a Vec cannot fail.
        let encoded = bincode::serialize(&view).unwrap_or_default();
        let mut hasher = Blake2b256::new();
        hasher.update(&encoded);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}

/// Observation of a message reported by a chain adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: FrostMessage,
    pub tx_id: Option<TxId>,
    pub block: Option<BlockId>,
}
