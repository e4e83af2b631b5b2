//! The relay orchestrator.
//!
//! Every admitted message runs as its own workflow task:
//!
//! ```text
//! Created -> SubmittedSource -> AwaitingSourceFinality -> Proving
//!         -> SubmittedDestination -> AwaitingDestinationFinality -> Verified
//! ```
//!
//! Any non-terminal state may fall to `Failed(reason)`. Workflows share the
//! adapter registry (bounded calls per chain), the proving pool (bounded
//! proofs) and the ledger (replay protection and audit trail).

mod batch;
mod config;
mod workflow;

pub use config::{BatchConfig, ConfigError, FinalityConfig, ProvingConfig, RelayConfig, RetryConfig};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use self::batch::{BatchQueue, DestinationBatcher};
use self::workflow::Workflow;
use crate::chainadapter::AdapterError;
use crate::error::RelayError;
use crate::frostmessage::{codec, ChainId, ChainMessageStatus, FailureReason, FrostMessage, MessageEvent, MessageStatus};
use crate::ledger::{Ledger, LedgerEntry};
use crate::registry::{AdapterLease, AdapterRegistry};
use crate::zkplug::{ProofBackend, ProvingPool};
use crate::Result;

/// Metadata key under which admission records the advisory fee.
pub const ESTIMATED_FEE_KEY: &str = "estimated_fee";

/// Leases a call slot on `chain`, reporting registry problems as connectivity errors.
pub(crate) async fn lease(registry: &AdapterRegistry, chain: &ChainId) -> std::result::Result<AdapterLease, AdapterError> {
    registry
        .acquire(chain)
        .await
        .map_err(|e| AdapterError::Connectivity(e.to_string()))
}

/// Folds one call into the chain's health. Terminal errors still prove the
/// endpoint answered.
pub(crate) async fn record_outcome<T>(
    registry: &AdapterRegistry,
    chain: &ChainId,
    result: &std::result::Result<T, AdapterError>,
    started: Instant,
) {
    let answered = match result {
        Ok(_) => true,
        Err(e) => !e.is_retryable(),
    };
    registry.record_call(chain, answered, started.elapsed()).await;
}

/// State shared by the orchestrator and its workflows.
pub(crate) struct RelayContext {
    registry: Arc<AdapterRegistry>,
    ledger: Ledger,
    pool: Arc<ProvingPool>,
    program: Vec<u8>,
    config: RelayConfig,
    batchers: AsyncMutex<HashMap<ChainId, BatchQueue>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl RelayContext {
    /// Batcher for `chain`, started on first use. `None` when batching is
    /// off or the chain cannot take batches.
    async fn batch_queue(&self, chain: &ChainId) -> Option<BatchQueue> {
        let config = self.config.batching.as_ref()?;
        let adapter = self.registry.get_adapter(chain).await.ok()?;
        if !adapter.capabilities().supports_batch_submission {
            return None;
        }

        let mut batchers = self.batchers.lock().await;
        let queue = batchers.entry(*chain).or_insert_with(|| {
            DestinationBatcher::spawn(
                *chain,
                self.registry.clone(),
                config.clone(),
                &self.tracker,
                self.shutdown.child_token(),
            )
        });
        Some(queue.clone())
    }
}

/// Handle to one admitted message.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    id: Uuid,
    status: watch::Receiver<MessageStatus>,
}

impl RelayHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Most recent status.
    pub fn status(&self) -> MessageStatus {
        self.status.borrow().clone()
    }

    /// Waits for the terminal status.
    pub async fn wait(mut self) -> MessageStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.is_terminal() || self.status.changed().await.is_err() {
                return current;
            }
        }
    }

    /// Waits for the message to be verified, turning a failure into an error.
    pub async fn wait_verified(self) -> Result<()> {
        let id = self.id;
        match self.wait().await {
            MessageStatus::Verified => Ok(()),
            MessageStatus::Failed(reason) => Err(RelayError::Failed { id, reason }),
            _ => Err(RelayError::ShuttingDown),
        }
    }
}

/// Authoritative ledger state next to what each chain reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub entry: LedgerEntry,
    /// `None` when the source adapter could not be asked
    pub source: Option<ChainMessageStatus>,
    pub destination: Option<ChainMessageStatus>,
}

impl StatusReport {
    pub fn status(&self) -> &MessageStatus {
        &self.entry.status
    }
}

/// Drives messages from their source chain to verification on their destination chain.
pub struct RelayOrchestrator {
    ctx: Arc<RelayContext>,
    workflows: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl RelayOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        pool: Arc<ProvingPool>,
        program: Vec<u8>,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            max_attempts = config.retry.max_attempts,
            batching = config.batching.is_some(),
            "Starting relay orchestrator with {} proving slots",
            pool.usage().capacity
        );

        Ok(Self {
            ctx: Arc::new(RelayContext {
                registry,
                ledger: Ledger::new(),
                pool,
                program,
                config,
                batchers: AsyncMutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
            workflows: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Builds the proving pool from `config.proving`.
    pub fn with_backend(
        registry: Arc<AdapterRegistry>,
        backend: Arc<dyn ProofBackend>,
        program: Vec<u8>,
        config: RelayConfig,
    ) -> Result<Self> {
        let pool = Arc::new(ProvingPool::new(backend, config.proving.max_concurrent_proofs));
        Self::new(registry, pool, program, config)
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.ctx.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ctx.ledger
    }

    pub fn proving_pool(&self) -> &Arc<ProvingPool> {
        &self.ctx.pool
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    /// Number of workflows still running.
    pub fn in_flight(&self) -> usize {
        self.workflows.lock().map(|w| w.len()).unwrap_or_default()
    }

    /// Admits a message and starts relaying it.
    ///
    /// Replayed nonces, reused ids and messages the chains cannot carry are
    /// rejected here; nothing is submitted for them.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn submit(&self, mut message: FrostMessage) -> Result<RelayHandle> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(RelayError::ShuttingDown);
        }
        if message.proof.is_some() {
            return Err(crate::frostmessage::MessageError::ProofAlreadyAttached(message.id).into());
        }

        let registry = &self.ctx.registry;
        let source = registry.get_adapter(&message.source_chain).await?;
        let destination = registry.get_adapter(&message.destination_chain).await?;

        for chain in [message.source_chain, message.destination_chain] {
            if !registry.is_healthy(&chain).await {
                warn!("Refusing message for unhealthy chain {}", chain);
                return Err(RelayError::UnhealthyAdapter(chain));
            }
        }
        let destination_caps = destination.capabilities();
        if !destination_caps.supports_onchain_verification {
            return Err(RelayError::VerificationUnsupported(message.destination_chain));
        }

        match self.estimate_fee(&message).await {
            Ok(fee) => message.insert_metadata(ESTIMATED_FEE_KEY, &fee.to_string()),
            Err(e) => debug!("No fee estimate from {}: {}", message.destination_chain, e),
        }

        let size = codec::encode(&message)?.len();
        for (chain, max) in [
            (message.source_chain, source.capabilities().max_message_size),
            (message.destination_chain, destination_caps.max_message_size),
        ] {
            if size > max {
                return Err(RelayError::MessageTooLarge { chain, size, max });
            }
        }

        self.ctx.ledger.reserve(&message).await?;
        let status = self.ctx.ledger.subscribe(&message.id).await?;
        info!(
            "Admitted message {} -> {} (nonce {})",
            message.source_chain, message.destination_chain, message.nonce
        );

        let id = message.id;
        self.spawn_workflow(message);
        Ok(RelayHandle { id, status })
    }

    async fn estimate_fee(&self, message: &FrostMessage) -> std::result::Result<u128, AdapterError> {
        let chain = message.destination_chain;
        let adapter = lease(&self.ctx.registry, &chain).await?;
        let started = Instant::now();
        let result = adapter.estimate_fee(message).await;
        drop(adapter);
        record_outcome(&self.ctx.registry, &chain, &result, started).await;
        result
    }

    fn spawn_workflow(&self, message: FrostMessage) {
        let id = message.id;
        let cancel = self.ctx.shutdown.child_token();
        if let Ok(mut workflows) = self.workflows.lock() {
            workflows.insert(id, cancel.clone());
        }

        let workflow = Workflow::new(self.ctx.clone(), message, cancel);
        let ctx = self.ctx.clone();
        let workflows = self.workflows.clone();
        self.ctx.tracker.spawn(async move {
            if let Err(e) = tokio::spawn(workflow.run()).await {
                error!(message_id = %id, "Workflow aborted: {}", e);
                let reason = if e.is_cancelled() {
                    FailureReason::Cancelled
                } else {
                    FailureReason::Protocol("workflow panicked".to_string())
                };
                if let Err(e) = ctx.ledger.record_status(&id, MessageStatus::Failed(reason)).await {
                    error!(message_id = %id, "Failed to record aborted workflow: {}", e);
                }
            }
            if let Ok(mut workflows) = workflows.lock() {
                workflows.remove(&id);
            }
        });
    }

    /// Submits and waits for the terminal status.
    pub async fn relay(&self, message: FrostMessage) -> Result<MessageStatus> {
        Ok(self.submit(message).await?.wait().await)
    }

    pub async fn status(&self, id: &Uuid) -> Result<MessageStatus> {
        Ok(self.ctx.ledger.lookup(id).await?.status)
    }

    /// Ledger entry merged with the chain-local views of both chains.
    pub async fn status_report(&self, id: &Uuid) -> Result<StatusReport> {
        let entry = self.ctx.ledger.lookup(id).await?;
        let source = self.chain_view(&entry.source_chain, id).await;
        let destination = self.chain_view(&entry.destination_chain, id).await;
        Ok(StatusReport {
            entry,
            source,
            destination,
        })
    }

    async fn chain_view(&self, chain: &ChainId, id: &Uuid) -> Option<ChainMessageStatus> {
        let adapter = lease(&self.ctx.registry, chain).await.ok()?;
        match adapter.message_status(id).await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(message_id = %id, "No status from {}: {}", chain, e);
                None
            }
        }
    }

    /// Cancels a running workflow. Returns whether one was running.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &Uuid) -> Result<bool> {
        if self.ctx.ledger.lookup(id).await?.is_terminal() {
            return Ok(false);
        }
        let token = self.workflows.lock().ok().and_then(|w| w.get(id).cloned());
        match token {
            Some(token) => {
                info!("Cancelling message");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Abandons a message whose source submission a reorg invalidated.
    #[instrument(skip(self))]
    pub async fn supersede(&self, id: &Uuid) -> Result<bool> {
        warn!("Message superseded by a source chain reorganization");
        self.cancel(id).await
    }

    /// Pulls new events from every enabled adapter.
    pub async fn poll_events(&self) -> Vec<MessageEvent> {
        let mut chains = Vec::new();
        for chain in self.ctx.registry.list_chain_ids().await {
            if self.ctx.registry.is_healthy(&chain).await {
                chains.push(chain);
            }
        }

        let registry = &self.ctx.registry;
        let polled = futures::future::join_all(chains.into_iter().map(|chain| async move {
            let adapter = lease(registry, &chain).await?;
            let started = Instant::now();
            let result = adapter.listen_for_events().await;
            drop(adapter);
            record_outcome(registry, &chain, &result, started).await;
            result.map_err(|e| {
                warn!("Event poll on {} failed: {}", chain, e);
                e
            })
        }))
        .await;

        let mut events = Vec::new();
        for batch in polled.into_iter().flatten() {
            for event in batch {
                if let Ok(entry) = self.ctx.ledger.lookup(&event.message.id).await {
                    debug!(message_id = %entry.id, status = %entry.status, "Observed event for relayed message");
                }
                events.push(event);
            }
        }
        events
    }

    /// Starts the registry's periodic health checks; they stop on shutdown.
    pub fn start_health_checks(&self) -> JoinHandle<()> {
        self.ctx
            .registry
            .clone()
            .start_health_checks(self.ctx.shutdown.child_token())
    }

    /// Cancels every workflow and waits for all relay tasks to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down relay orchestrator with {} workflows in flight", self.in_flight());
        self.ctx.shutdown.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chainadapter::{ChainAdapter, ChainCapabilities};
    use crate::ledger::LedgerError;
    use crate::mock::{MockChainAdapter, MockFailure, MockProofBackend};
    use crate::registry::{RegistryConfig, RegistryError};
    use crate::zkplug::ProofError;

    struct Harness {
        relay: RelayOrchestrator,
        source: Arc<MockChainAdapter>,
        destination: Arc<MockChainAdapter>,
        backend: Arc<MockProofBackend>,
    }

    fn config() -> RelayConfig {
        RelayConfig::development().with_registry(RegistryConfig::default())
    }

    async fn harness_with(
        config: RelayConfig,
        source: MockChainAdapter,
        destination: MockChainAdapter,
        backend: MockProofBackend,
    ) -> Harness {
        let source = Arc::new(source);
        let destination = Arc::new(destination);
        let backend = Arc::new(backend);

        let registry = Arc::new(AdapterRegistry::with_config(config.registry.clone()));
        registry.register_adapter(source.clone()).await.unwrap();
        registry.register_adapter(destination.clone()).await.unwrap();

        let relay = RelayOrchestrator::with_backend(registry, backend.clone(), b"relay-circuit".to_vec(), config).unwrap();
        Harness {
            relay,
            source,
            destination,
            backend,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new(),
        )
        .await
    }

    fn message(nonce: u64) -> FrostMessage {
        FrostMessage::new(ChainId::Ethereum, ChainId::Polkadot, b"hello".to_vec(), nonce).with_sender(vec![0xab; 20])
    }

    async fn wait_for(relay: &RelayOrchestrator, id: &Uuid, status: MessageStatus) {
        for _ in 0..10_000 {
            if relay.status(id).await.unwrap() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message {} never reached {}", id, status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_is_verified() {
        let h = harness().await;
        let msg = message(1);
        let id = msg.id;

        assert_eq!(h.relay.relay(msg).await.unwrap(), MessageStatus::Verified);

        let entry = h.relay.ledger().lookup(&id).await.unwrap();
        let path: Vec<MessageStatus> = entry.history.iter().map(|t| t.status.clone()).collect();
        assert_eq!(
            path,
            vec![
                MessageStatus::Created,
                MessageStatus::SubmittedSource,
                MessageStatus::AwaitingSourceFinality,
                MessageStatus::Proving,
                MessageStatus::SubmittedDestination,
                MessageStatus::AwaitingDestinationFinality,
                MessageStatus::Verified,
            ]
        );
        assert_eq!(entry.source_tx, Some(h.source.tx_id_for(&id)));
        assert_eq!(entry.destination_tx, Some(h.destination.tx_id_for(&id)));
        assert_eq!(entry.retries.total(), 0);
        assert_eq!(h.destination.verify_calls(), 1);
        assert_eq!(h.backend.executions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_records_fee_estimate() {
        let h = harness().await;
        let msg = message(1);
        let id = msg.id;
        h.relay.relay(msg).await.unwrap();

        let raw = h.source.get_transaction(&h.source.tx_id_for(&id)).await.unwrap().unwrap();
        let submitted = codec::decode(&raw).unwrap();
        assert_eq!(submitted.metadata_value(ESTIMATED_FEE_KEY), Some("21080"));
        assert!(submitted.proof.is_none());

        let raw = h.destination.get_transaction(&h.destination.tx_id_for(&id)).await.unwrap().unwrap();
        assert!(codec::decode(&raw).unwrap().proof.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_nonce_never_submitted() {
        let h = harness().await;
        let first = message(1);
        let replay = message(1);
        let replay_id = replay.id;

        let handle = h.relay.submit(first.clone()).await.unwrap();
        let err = h.relay.submit(replay).await.unwrap_err();
        assert!(matches!(err, RelayError::NonceReplay { nonce: 1, last: 1, .. }));

        let err = h.relay.submit(first).await.unwrap_err();
        assert!(matches!(err, RelayError::DuplicateId(_)));

        assert_eq!(handle.wait().await, MessageStatus::Verified);
        assert!(!h.source.submission_order().contains(&replay_id));
        assert!(matches!(
            h.relay.status(&replay_id).await,
            Err(RelayError::Ledger(LedgerError::NotFound(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_exhausts_exact_attempts() {
        let h = harness().await;
        h.source.script_submit_failures(10, MockFailure::Connectivity);
        let msg = message(1);
        let id = msg.id;

        let status = h.relay.relay(msg).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::SubmissionExhausted));
        assert_eq!(h.source.submit_calls(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.source.submit_calls(), 3);

        let entry = h.relay.ledger().lookup(&id).await.unwrap();
        assert_eq!(entry.retries.submission, 2);
        assert!(!entry.has_visited(&MessageStatus::SubmittedSource));
        assert!(entry.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submission_failures_recover() {
        let h = harness().await;
        h.source.script_submit_failures(2, MockFailure::RateLimited);
        let msg = message(1);
        let id = msg.id;

        assert_eq!(h.relay.relay(msg).await.unwrap(), MessageStatus::Verified);
        assert_eq!(h.source.submit_calls(), 3);
        assert_eq!(h.relay.ledger().lookup(&id).await.unwrap().retries.submission, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_is_terminal() {
        let h = harness().await;
        h.source.script_submit_failures(1, MockFailure::Protocol);

        let status = h.relay.relay(message(1)).await.unwrap();
        assert!(matches!(status, MessageStatus::Failed(FailureReason::Protocol(_))));
        assert_eq!(h.source.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_transaction_is_resubmitted() {
        let h = harness().await;
        h.source.drop_next_submissions(1);
        let msg = message(1);
        let id = msg.id;

        assert_eq!(h.relay.relay(msg).await.unwrap(), MessageStatus::Verified);
        assert_eq!(h.source.submit_calls(), 2);

        let entry = h.relay.ledger().lookup(&id).await.unwrap();
        assert_eq!(entry.retries.finality, 1);
        let resubmissions = entry
            .history
            .iter()
            .filter(|t| t.status == MessageStatus::SubmittedSource)
            .count();
        assert_eq!(resubmissions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reorg_during_source_finality() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum).with_confirmations(6),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new(),
        )
        .await;
        let msg = message(1);
        let id = msg.id;

        let handle = h.relay.submit(msg).await.unwrap();
        wait_for(&h.relay, &id, MessageStatus::AwaitingSourceFinality).await;
        h.source.reorg_from(1);

        assert_eq!(handle.wait().await, MessageStatus::Verified);
        assert_eq!(h.source.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_proving_frees_slot() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new().with_delay(Duration::from_secs(3600)),
        )
        .await;
        let msg = message(1);
        let id = msg.id;

        let handle = h.relay.submit(msg).await.unwrap();
        wait_for(&h.relay, &id, MessageStatus::Proving).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.backend.get_resource_usage().await.active_jobs, 1);

        assert!(h.relay.cancel(&id).await.unwrap());
        assert_eq!(handle.wait().await, MessageStatus::Failed(FailureReason::Cancelled));

        assert_eq!(h.backend.get_resource_usage().await.active_jobs, 0);
        assert_eq!(h.relay.proving_pool().usage().active, 0);
        assert_eq!(h.destination.submit_calls(), 0);
        assert!(!h.relay.cancel(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_cancels_workflow() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum).with_auto_mine(0),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new(),
        )
        .await;
        let msg = message(1);
        let id = msg.id;

        let handle = h.relay.submit(msg).await.unwrap();
        wait_for(&h.relay, &id, MessageStatus::AwaitingSourceFinality).await;
        assert!(h.relay.supersede(&id).await.unwrap());
        assert_eq!(handle.wait().await, MessageStatus::Failed(FailureReason::Cancelled));
        assert!(h.relay.ledger().pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitive_rejection_stops_destination() {
        let h = harness().await;
        h.destination.script_verify_failures(1, MockFailure::Rejected);

        let status = h.relay.relay(message(1)).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::ProofRejected));
        assert_eq!(h.destination.verify_calls(), 1);
        assert_eq!(h.destination.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_verification_failures() {
        let h = harness().await;
        h.destination.script_verify_failures(2, MockFailure::Timeout);
        let msg = message(1);
        let id = msg.id;
        assert_eq!(h.relay.relay(msg).await.unwrap(), MessageStatus::Verified);
        assert_eq!(h.relay.ledger().lookup(&id).await.unwrap().retries.verification, 2);

        h.destination.script_verify_failures(3, MockFailure::Timeout);
        let status = h.relay.relay(message(2)).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::VerificationExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proof_failing_local_check_is_rejected() {
        let h = harness().await;
        h.backend.reject_verification();

        let status = h.relay.relay(message(1)).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::ProofRejected));
        assert_eq!(h.destination.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proving_failures() {
        let h = harness().await;

        h.backend.script_failures(1, ProofError::Overloaded("queue full".into()));
        let msg = message(1);
        let id = msg.id;
        assert_eq!(h.relay.relay(msg).await.unwrap(), MessageStatus::Verified);
        assert_eq!(h.relay.ledger().lookup(&id).await.unwrap().retries.proving, 1);

        h.backend.script_failures(3, ProofError::ResourceExhausted("oom".into()));
        let status = h.relay.relay(message(2)).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::ProvingExhausted));

        h.backend.script_failures(1, ProofError::InvalidInput("bad witness".into()));
        let status = h.relay.relay(message(3)).await.unwrap();
        assert_eq!(status, MessageStatus::Failed(FailureReason::ProofRejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_checks() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot).with_capabilities(ChainCapabilities {
                max_message_size: 256,
                ..ChainCapabilities::default()
            }),
            MockProofBackend::new(),
        )
        .await;

        let unknown = FrostMessage::new(ChainId::Ethereum, ChainId::Sui, vec![], 1);
        assert!(matches!(
            h.relay.submit(unknown).await,
            Err(RelayError::Registry(RegistryError::NotFound(ChainId::Sui)))
        ));

        let oversized = FrostMessage::new(ChainId::Ethereum, ChainId::Polkadot, vec![0; 1024], 1);
        assert!(matches!(
            h.relay.submit(oversized).await,
            Err(RelayError::MessageTooLarge {
                chain: ChainId::Polkadot,
                max: 256,
                ..
            })
        ));

        let mut proven = message(1);
        proven.attach_proof(crate::frostmessage::ProofData::Inclusion(vec![1])).unwrap();
        assert!(matches!(h.relay.submit(proven).await, Err(RelayError::Message(_))));

        assert!(h.relay.ledger().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_without_onchain_verification() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot).without_onchain_verification(),
            MockProofBackend::new(),
        )
        .await;

        let err = h.relay.submit(message(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::VerificationUnsupported(ChainId::Polkadot)));
        assert_eq!(h.source.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_source_refused() {
        let h = harness().await;
        h.source.script_health_failures(RegistryConfig::default().max_consecutive_failures);
        for _ in 0..RegistryConfig::default().max_consecutive_failures {
            h.relay.registry().run_health_checks().await;
        }

        let err = h.relay.submit(message(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::UnhealthyAdapter(ChainId::Ethereum)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_destination_refused() {
        let h = harness().await;
        let failures = RegistryConfig::default().max_consecutive_failures;
        h.destination.script_health_failures(failures);
        for _ in 0..failures {
            h.relay.registry().run_health_checks().await;
        }

        let err = h.relay.submit(message(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::UnhealthyAdapter(ChainId::Polkadot)));
        assert_eq!(h.source.submit_calls(), 0);
        assert!(h.relay.ledger().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fee_estimate_takes_call_slot() {
        let h = harness_with(
            config().with_registry(RegistryConfig::default().with_max_concurrent_calls(1)),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new(),
        )
        .await;

        let held = h.relay.registry().acquire(&ChainId::Polkadot).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_secs(1), h.relay.submit(message(1))).await;
        assert!(blocked.is_err());
        assert!(h.relay.ledger().is_empty().await);
        drop(held);

        let handle = h.relay.submit(message(1)).await.unwrap();
        let destination_calls = |summaries: Vec<crate::registry::AdapterSummary>| {
            summaries
                .into_iter()
                .find(|s| s.chain_id == ChainId::Polkadot)
                .map(|s| s.health.total_calls)
        };
        assert_eq!(destination_calls(h.relay.registry().summaries().await), Some(1));
        assert_eq!(handle.wait().await, MessageStatus::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_sender_submits_in_nonce_order() {
        let h = harness().await;
        h.source.script_submit_failures(1, MockFailure::Connectivity);
        let first = message(1);
        let second = message(2);

        let first_handle = h.relay.submit(first.clone()).await.unwrap();
        let second_handle = h.relay.submit(second.clone()).await.unwrap();
        assert_eq!(first_handle.wait().await, MessageStatus::Verified);
        assert_eq!(second_handle.wait().await, MessageStatus::Verified);

        assert_eq!(h.source.submission_order(), vec![first.id, second.id]);
        assert_eq!(h.relay.ledger().lookup(&first.id).await.unwrap().retries.submission, 1);
        assert_eq!(h.relay.ledger().lookup(&second.id).await.unwrap().retries.submission, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_predecessor_unblocks_next_nonce() {
        let h = harness().await;
        h.source.script_submit_failures(1, MockFailure::Protocol);
        let first = h.relay.submit(message(1)).await.unwrap();
        let second = h.relay.submit(message(2)).await.unwrap();

        assert!(matches!(first.wait().await, MessageStatus::Failed(FailureReason::Protocol(_))));
        assert_eq!(second.wait().await, MessageStatus::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_batched_skips_destination() {
        let config = config().with_batching(BatchConfig {
            max_batch_size: 10,
            max_batch_wait: Duration::from_secs(5),
        });
        let h = harness_with(
            config,
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot).with_batch_submission(),
            MockProofBackend::new(),
        )
        .await;
        let msg = message(1);
        let id = msg.id;

        let handle = h.relay.submit(msg).await.unwrap();
        wait_for(&h.relay, &id, MessageStatus::Proving).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.backend.executions(), 1);

        assert!(h.relay.cancel(&id).await.unwrap());
        assert_eq!(handle.wait().await, MessageStatus::Failed(FailureReason::Cancelled));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.destination.submit_calls(), 0);
        assert_eq!(h.destination.batch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_destination_keeps_nonce_order() {
        let config = config().with_batching(BatchConfig {
            max_batch_size: 3,
            max_batch_wait: Duration::from_secs(1),
        });
        let h = harness_with(
            config,
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot).with_batch_submission(),
            MockProofBackend::new(),
        )
        .await;

        let messages: Vec<FrostMessage> = (1..=3).map(message).collect();
        let mut handles = Vec::new();
        for msg in &messages {
            handles.push(h.relay.submit(msg.clone()).await.unwrap());
        }
        for handle in handles {
            assert_eq!(handle.wait().await, MessageStatus::Verified);
        }

        assert_eq!(h.destination.batch_calls(), 1);
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        assert_eq!(h.destination.submission_order(), ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_report_merges_chain_views() {
        let h = harness().await;
        let msg = message(1);
        let id = msg.id;
        h.relay.relay(msg).await.unwrap();

        let report = h.relay.status_report(&id).await.unwrap();
        assert_eq!(report.status(), &MessageStatus::Verified);
        assert_eq!(report.source, Some(ChainMessageStatus::Confirmed));
        assert_eq!(report.destination, Some(ChainMessageStatus::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight_work() {
        let h = harness_with(
            config(),
            MockChainAdapter::new(ChainId::Ethereum),
            MockChainAdapter::new(ChainId::Polkadot),
            MockProofBackend::new().with_delay(Duration::from_secs(3600)),
        )
        .await;

        let first = h.relay.submit(message(1)).await.unwrap();
        let second = h.relay.submit(message(2)).await.unwrap();
        wait_for(&h.relay, &first.id(), MessageStatus::Proving).await;

        h.relay.shutdown().await;
        assert_eq!(first.wait().await, MessageStatus::Failed(FailureReason::Cancelled));
        assert_eq!(second.wait().await, MessageStatus::Failed(FailureReason::Cancelled));
        assert_eq!(h.relay.in_flight(), 0);
        assert!(matches!(h.relay.submit(message(3)).await, Err(RelayError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_events_drains_adapters() {
        let h = harness().await;
        h.source.push_event(MessageEvent {
            message: message(1),
            tx_id: None,
            block: None,
        });

        assert_eq!(h.relay.poll_events().await.len(), 1);
        assert!(h.relay.poll_events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_senders_run_in_parallel() {
        let h = harness().await;
        let mut handles = Vec::new();
        for sender in 0..8u8 {
            let msg = FrostMessage::new(ChainId::Ethereum, ChainId::Polkadot, vec![sender], 1).with_sender(vec![sender]);
            handles.push(h.relay.submit(msg).await.unwrap());
        }
        for handle in handles {
            handle.wait_verified().await.unwrap();
        }
        assert_eq!(h.relay.ledger().len().await, 8);
        assert!(h.backend.peak_active_jobs() <= h.relay.config().proving.max_concurrent_proofs);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = Arc::new(AdapterRegistry::new());
        let backend: Arc<dyn ProofBackend> = Arc::new(MockProofBackend::new());
        let result = RelayOrchestrator::with_backend(registry, backend, vec![], RelayConfig::default().with_max_attempts(0));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
