use uuid::Uuid;

use crate::chainadapter::AdapterError;
use crate::finality::FinalityError;
use crate::frostmessage::{ChainId, CodecError, FailureReason, MessageError, ReplayKey};
use crate::ledger::LedgerError;
use crate::registry::RegistryError;
use crate::relay::ConfigError;
use crate::zkplug::ProofError;

/// Errors surfaced to callers of the relay.
///
/// Admission problems are returned from `submit` before a message enters
/// the pipeline. Once admitted, a message only ever fails through its
/// [`FailureReason`].
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("Nonce {nonce} for {key} already used (last reserved {last})")]
    NonceReplay { key: ReplayKey, nonce: u64, last: u64 },

    #[error("Message {0} was already submitted")]
    DuplicateId(Uuid),

    #[error("Adapter for chain {0} is unhealthy")]
    UnhealthyAdapter(ChainId),

    #[error("Chain {0} cannot verify proofs on-chain")]
    VerificationUnsupported(ChainId),

    #[error("Message of {size} bytes exceeds the {max} byte limit of chain {chain}")]
    MessageTooLarge { chain: ChainId, size: usize, max: usize },

    #[error("Message {id} failed: {reason}")]
    Failed { id: Uuid, reason: FailureReason },

    #[error("Relay is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Finality(#[from] FinalityError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<LedgerError> for RelayError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::NonceReplay { key, nonce, last } => RelayError::NonceReplay { key, nonce, last },
            LedgerError::DuplicateId(id) => RelayError::DuplicateId(id),
            other => RelayError::Ledger(other),
        }
    }
}

impl RelayError {
    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::UnhealthyAdapter(_) => true,
            RelayError::Adapter(e) => e.is_retryable(),
            RelayError::Proof(e) => e.is_retryable(),
            RelayError::Finality(e) => e.is_retryable(),
            _ => false,
        }
    }
}
