use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of attestation carried by a [`ProofData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofKind {
    ZeroKnowledge,
    SignatureAttestation,
    Inclusion,
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProofKind::ZeroKnowledge => "zk",
            ProofKind::SignatureAttestation => "attestation",
            ProofKind::Inclusion => "inclusion",
        };
        f.write_str(name)
    }
}

/// Proof artifact produced by a proof backend.
///
/// The payload is opaque to the relay; only the backend that produced it
/// (and the destination chain) know how to interpret the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofData {
    ZeroKnowledge(Vec<u8>),
    SignatureAttestation(Vec<u8>),
    Inclusion(Vec<u8>),
}

impl ProofData {
    pub fn new(kind: ProofKind, bytes: Vec<u8>) -> Self {
        match kind {
            ProofKind::ZeroKnowledge => ProofData::ZeroKnowledge(bytes),
            ProofKind::SignatureAttestation => ProofData::SignatureAttestation(bytes),
            ProofKind::Inclusion => ProofData::Inclusion(bytes),
        }
    }

    pub fn kind(&self) -> ProofKind {
        match self {
            ProofData::ZeroKnowledge(_) => ProofKind::ZeroKnowledge,
            ProofData::SignatureAttestation(_) => ProofKind::SignatureAttestation,
            ProofData::Inclusion(_) => ProofKind::Inclusion,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ProofData::ZeroKnowledge(bytes)
            | ProofData::SignatureAttestation(bytes)
            | ProofData::Inclusion(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}
