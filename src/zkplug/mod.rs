//! Pluggable proof systems.
//!
//! A [`ProofBackend`] wraps one proving engine behind execute/verify. The
//! relay never assumes anything about the engine beyond this contract:
//! `verify(execute(p, x), x)` holds for valid inputs, and verification is
//! cheap, pure and deterministic.

pub mod pool;

pub use pool::{PoolUsage, ProvingPool};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::frostmessage::{BlockId, FrostMessage, ProofData, ProofKind, TxId};
use crate::utils::duration_millis;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// Backend at capacity; try again later
    #[error("Proof backend overloaded: {0}")]
    Overloaded(String),

    /// Ran out of memory, GPU or time budget
    #[error("Proof backend resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The witness does not satisfy the program; proving again gives the same answer
    #[error("Invalid proving input: {0}")]
    InvalidInput(String),

    #[error("Proof backend error: {0}")]
    Backend(String),

    #[error("Proving cancelled")]
    Cancelled,
}

impl ProofError {
    /// Resource-related failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProofError::Overloaded(_) | ProofError::ResourceExhausted(_))
    }
}

/// Proving and verifying keys of one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendKeys {
    pub proving_key: Vec<u8>,
    pub verifying_key: Vec<u8>,
}

/// Resources consumed by recent proving, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub active_jobs: usize,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    #[serde(with = "duration_millis")]
    pub proving_time: Duration,
}

/// A proof system plugged into the relay.
#[async_trait]
pub trait ProofBackend: Send + Sync {
    fn backend_id(&self) -> String;

    /// Kind of proof `execute` produces.
    fn proof_kind(&self) -> ProofKind;

    /// Produce a proof that `program` accepts `input`. Potentially long
    /// running; callers cancel by dropping the future.
    async fn execute(&self, program: &[u8], input: &[u8]) -> Result<ProofData, ProofError>;

    /// Check a proof, optionally against its public input.
    async fn verify(&self, proof: &ProofData, input: Option<&[u8]>) -> Result<bool, ProofError>;

    /// Static per instance; callers cache the result.
    async fn get_keys(&self) -> Result<BackendKeys, ProofError>;

    async fn get_resource_usage(&self) -> ResourceUsage;
}

/// Circuit input for proving that a message was finalized on its source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingInput {
    pub message_digest: [u8; 32],
    pub source_tx: TxId,
    pub source_block: BlockId,
}

impl ProvingInput {
    pub fn new(message: &FrostMessage, source_tx: TxId, source_block: BlockId) -> Self {
        Self {
            message_digest: message.digest(),
            source_tx,
            source_block,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProofError> {
        bincode::serialize(self).map_err(|e| ProofError::InvalidInput(e.to_string()))
    }
}
