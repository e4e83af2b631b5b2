// Chain Abstraction Layer

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::frostmessage::{BlockId, ChainId, ChainMessageStatus, FrostMessage, MessageEvent, TxId};

/// Errors reported by chain adapters.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    /// Endpoint unreachable or connection dropped
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Request timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Endpoint is throttling requests
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The awaited block did not become final in time
    #[error("Finality timeout: {0}")]
    FinalityTimeout(String),

    /// The referenced block is no longer part of the canonical chain
    #[error("Block {0} was reorganized out")]
    Reorganized(BlockId),

    /// The same message was already broadcast as the given transaction
    #[error("Message already submitted as {0}")]
    AlreadySubmitted(TxId),

    /// The chain definitively refused the request (e.g. proof rejected by the verifier)
    #[error("Rejected by chain: {0}")]
    Rejected(String),

    /// Malformed response or protocol mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not supported by this chain
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Whether the relay may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Connectivity(_)
                | AdapterError::Timeout(_)
                | AdapterError::RateLimited(_)
                | AdapterError::FinalityTimeout(_)
                | AdapterError::Reorganized(_)
                | AdapterError::Other(_)
        )
    }
}

impl From<crate::frostmessage::CodecError> for AdapterError {
    fn from(error: crate::frostmessage::CodecError) -> Self {
        AdapterError::Serialization(error.to_string())
    }
}

impl From<String> for AdapterError {
    fn from(error: String) -> Self {
        AdapterError::Other(anyhow::anyhow!(error))
    }
}

impl From<&str> for AdapterError {
    fn from(error: &str) -> Self {
        AdapterError::Other(anyhow::anyhow!(error.to_string()))
    }
}

/// Types of finality mechanisms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalityType {
    Probabilistic { confirmations: u64 },
    Deterministic,
    Instant,
}

impl FinalityType {
    /// Blocks required on top of a block before it counts as final.
    pub fn depth(&self) -> u64 {
        match self {
            FinalityType::Probabilistic { confirmations } => *confirmations,
            FinalityType::Deterministic | FinalityType::Instant => 0,
        }
    }
}

/// Chain capabilities and features
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCapabilities {
    pub supports_onchain_verification: bool,
    pub supports_batch_submission: bool,
    pub max_message_size: usize,
    pub finality: FinalityType,
}

impl Default for ChainCapabilities {
    fn default() -> Self {
        Self {
            supports_onchain_verification: true,
            supports_batch_submission: false,
            max_message_size: 32_768,
            finality: FinalityType::Deterministic,
        }
    }
}

/// Core trait for chain adapters (EVM, Substrate, Solana, etc).
///
/// Every operation may be called concurrently from many in-flight relay
/// workflows. Chain-native identifiers cross this boundary as the opaque
/// [`TxId`] and [`BlockId`] wrappers.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Chain this adapter talks to.
    fn chain_id(&self) -> ChainId;

    /// Unique identifier for this adapter instance.
    fn adapter_id(&self) -> String;

    fn capabilities(&self) -> ChainCapabilities;

    /// Latest finalized (not merely tip) block.
    async fn latest_block(&self) -> Result<BlockId, AdapterError>;

    /// Raw transaction bytes, `None` if the chain has not seen it.
    async fn get_transaction(&self, tx: &TxId) -> Result<Option<Vec<u8>>, AdapterError>;

    /// Block the transaction is currently included in, `None` if not included.
    async fn transaction_block(&self, tx: &TxId) -> Result<Option<BlockId>, AdapterError>;

    /// Wait until the given block is irreversible under the chain's own rule.
    ///
    /// Returns [`AdapterError::Reorganized`] if the block left the canonical
    /// chain and [`AdapterError::FinalityTimeout`] instead of blocking forever.
    async fn wait_for_finality(&self, block: &BlockId) -> Result<(), AdapterError>;

    /// Encode and broadcast a message.
    ///
    /// Submitting the same message twice yields the same transaction or
    /// [`AdapterError::AlreadySubmitted`].
    async fn submit_message(&self, msg: &FrostMessage) -> Result<TxId, AdapterError>;

    /// Submit several messages at once, in the given order.
    async fn submit_batch(&self, msgs: &[FrostMessage]) -> Result<Vec<TxId>, AdapterError> {
        let mut txs = Vec::with_capacity(msgs.len());
        for msg in msgs {
            txs.push(self.submit_message(msg).await?);
        }
        Ok(txs)
    }

    /// Events observed since the previous call.
    async fn listen_for_events(&self) -> Result<Vec<MessageEvent>, AdapterError>;

    /// Ask the chain itself to verify the attached proof.
    async fn verify_on_chain(&self, msg: &FrostMessage) -> Result<(), AdapterError>;

    /// Advisory native fee for submitting a message.
    async fn estimate_fee(&self, msg: &FrostMessage) -> Result<u128, AdapterError>;

    /// Chain-local status (pending, in flight, confirmed, failed).
    async fn message_status(&self, id: &Uuid) -> Result<ChainMessageStatus, AdapterError>;

    /// Health check (for monitoring).
    async fn health_check(&self) -> Result<(), AdapterError>;
}

/// Resolves the outcome of a submission, accepting an already broadcast
/// transaction as success.
pub fn accept_duplicate(result: Result<TxId, AdapterError>) -> Result<TxId, AdapterError> {
    match result {
        Err(AdapterError::AlreadySubmitted(tx)) => {
            warn!("Message already submitted as {}, reusing transaction", tx);
            Ok(tx)
        }
        other => other,
    }
}
