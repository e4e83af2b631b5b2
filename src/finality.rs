//! Turns point-in-time block queries into a single "final or not" answer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::chainadapter::{AdapterError, ChainAdapter};
use crate::frostmessage::{BlockId, ChainId, TxId};
use crate::utils::duration_millis;

#[derive(thiserror::Error, Debug)]
pub enum FinalityError {
    #[error("Finality not reached within {0:?}")]
    Timeout(Duration),

    #[error("Block {0} was reorganized out")]
    Reorganized(BlockId),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl FinalityError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FinalityError::Timeout(_) | FinalityError::Reorganized(_) => true,
            FinalityError::Adapter(e) => e.is_retryable(),
        }
    }
}

/// Finality waiting parameters shared by all chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityConfig {
    /// Upper bound for one finality wait
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Delay between `latest_block` polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Confirmation depth per chain, overriding the adapter's own rule
    #[serde(default)]
    pub depth_overrides: BTreeMap<ChainId, u64>,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(6),
            depth_overrides: BTreeMap::new(),
        }
    }
}

/// Watches one chain for finality of blocks and transactions.
pub struct FinalityTracker {
    adapter: Arc<dyn ChainAdapter>,
    call_limit: Option<Arc<Semaphore>>,
    depth: u64,
    poll_interval: Duration,
    timeout: Duration,
}

impl FinalityTracker {
    pub fn new(adapter: Arc<dyn ChainAdapter>, config: &FinalityConfig) -> Self {
        let depth = config
            .depth_overrides
            .get(&adapter.chain_id())
            .copied()
            .unwrap_or_else(|| adapter.capabilities().finality.depth());

        Self {
            adapter,
            call_limit: None,
            depth,
            poll_interval: config.poll_interval,
            timeout: config.timeout,
        }
    }

    /// Counts every `latest_block` and `transaction_block` poll against the
    /// chain's outstanding call limit.
    pub fn with_call_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.call_limit = Some(limit);
        self
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    async fn permit(&self) -> Result<Option<SemaphorePermit<'_>>, AdapterError> {
        match &self.call_limit {
            Some(limit) => limit
                .acquire()
                .await
                .map(Some)
                .map_err(|_| AdapterError::Connectivity(format!("adapter for {} removed", self.adapter.chain_id()))),
            None => Ok(None),
        }
    }

    async fn latest_block(&self) -> Result<BlockId, AdapterError> {
        let _permit = self.permit().await?;
        self.adapter.latest_block().await
    }

    async fn transaction_block(&self, tx: &TxId) -> Result<Option<BlockId>, AdapterError> {
        let _permit = self.permit().await?;
        self.adapter.transaction_block(tx).await
    }

    /// May suspend for as long as the chain takes, so it holds no call slot.
    async fn confirm(&self, block: &BlockId) -> Result<(), AdapterError> {
        self.adapter.wait_for_finality(block).await
    }

    /// Whether the finalized head is deep enough over `block`.
    async fn deep_enough(&self, block: &BlockId) -> Result<bool, AdapterError> {
        let latest = self.latest_block().await?;
        let reached = latest.height >= block.height.saturating_add(self.depth);
        if !reached {
            debug!(
                chain = %self.adapter.chain_id(),
                "Block {} at depth {}/{}",
                block,
                latest.depth_over(block),
                self.depth
            );
        }
        Ok(reached)
    }

    /// Waits until `block` is final.
    ///
    /// Fails with [`FinalityError::Reorganized`] if the block leaves the
    /// canonical chain; the caller has to re-anchor.
    pub async fn wait_for_block(&self, block: &BlockId) -> Result<(), FinalityError> {
        match timeout(self.timeout, self.track_block(block)).await {
            Ok(result) => result,
            Err(_) => Err(FinalityError::Timeout(self.timeout)),
        }
    }

    async fn track_block(&self, block: &BlockId) -> Result<(), FinalityError> {
        loop {
            match self.deep_enough(block).await {
                Ok(true) => match self.confirm(block).await {
                    Ok(()) => return Ok(()),
                    Err(AdapterError::Reorganized(gone)) => return Err(FinalityError::Reorganized(gone)),
                    Err(e) if e.is_retryable() => debug!("Finality confirmation for {} pending: {}", block, e),
                    Err(e) => return Err(e.into()),
                },
                Ok(false) => {}
                Err(e) if e.is_retryable() => warn!("Polling latest block failed: {}", e),
                Err(e) => return Err(e.into()),
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Waits until the block including `tx` is final and returns that block.
    ///
    /// The wait re-anchors whenever the transaction moves to another block or
    /// disappears, so a block that was reorganized away is never reported.
    pub async fn wait_for_transaction(&self, tx: &TxId) -> Result<BlockId, FinalityError> {
        match timeout(self.timeout, self.track_transaction(tx)).await {
            Ok(result) => result,
            Err(_) => Err(FinalityError::Timeout(self.timeout)),
        }
    }

    async fn track_transaction(&self, tx: &TxId) -> Result<BlockId, FinalityError> {
        let chain = self.adapter.chain_id();
        let mut anchor: Option<BlockId> = None;

        loop {
            match self.transaction_block(tx).await {
                Ok(Some(block)) => {
                    match &anchor {
                        Some(previous) if *previous != block => {
                            warn!(%chain, "Transaction {} moved from {} to {}, re-anchoring", tx, previous, block);
                        }
                        None => debug!(%chain, "Transaction {} anchored at {}", tx, block),
                        _ => {}
                    }
                    anchor = Some(block.clone());

                    match self.deep_enough(&block).await {
                        Ok(true) => match self.confirm(&block).await {
                            Ok(()) => return Ok(block),
                            Err(AdapterError::Reorganized(gone)) => {
                                warn!(%chain, "Block {} reorganized out while confirming {}", gone, tx);
                                continue;
                            }
                            Err(e) if e.is_retryable() => debug!(%chain, "Confirmation pending: {}", e),
                            Err(e) => return Err(e.into()),
                        },
                        Ok(false) => {}
                        Err(e) if e.is_retryable() => warn!(%chain, "Polling latest block failed: {}", e),
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None) => {
                    if let Some(previous) = anchor.take() {
                        warn!(%chain, "Transaction {} left block {}, waiting for re-inclusion", tx, previous);
                    }
                }
                Err(e) if e.is_retryable() => warn!(%chain, "Inclusion lookup for {} failed: {}", tx, e),
                Err(e) => return Err(e.into()),
            }
            sleep(self.poll_interval).await;
        }
    }
}
