//! Scriptable in-memory chain adapter and proof backend.
//!
//! The mock chain keeps a finalized head that advances on every
//! `latest_block` poll, includes submitted messages in the next block, and
//! can be told to fail calls, drop transactions or reorganize.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use uuid::Uuid;

use crate::chainadapter::{AdapterError, ChainAdapter, ChainCapabilities, FinalityType};
use crate::frostmessage::{
    codec, BlockId, ChainId, ChainMessageStatus, FrostMessage, MessageEvent, ProofData, ProofKind, TxId,
};
use crate::zkplug::{BackendKeys, ProofBackend, ProofError, ResourceUsage};

/// Failure injected into a scripted adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Connectivity,
    Timeout,
    RateLimited,
    Protocol,
    Rejected,
}

impl MockFailure {
    fn into_error(self, op: &str) -> AdapterError {
        match self {
            MockFailure::Connectivity => AdapterError::Connectivity(format!("{}: connection refused", op)),
            MockFailure::Timeout => AdapterError::Timeout(format!("{}: request timed out", op)),
            MockFailure::RateLimited => AdapterError::RateLimited(format!("{}: too many requests", op)),
            MockFailure::Protocol => AdapterError::Protocol(format!("{}: malformed response", op)),
            MockFailure::Rejected => AdapterError::Rejected(format!("{}: rejected", op)),
        }
    }
}

struct TxRecord {
    tx: TxId,
    raw: Vec<u8>,
    block: Option<BlockId>,
}

#[derive(Default)]
struct ChainState {
    head: u64,
    /// (first affected height, epoch) for every simulated reorg
    forks: Vec<(u64, u8)>,
    txs: HashMap<Uuid, TxRecord>,
    submit_failures: VecDeque<MockFailure>,
    verify_failures: VecDeque<MockFailure>,
    health_failures: u32,
    drop_next: u32,
    events: Vec<MessageEvent>,
    submission_order: Vec<Uuid>,
    submit_calls: u32,
    batch_calls: u32,
    verify_calls: u32,
}

impl ChainState {
    fn epoch_at(&self, height: u64) -> u8 {
        self.forks
            .iter()
            .filter(|(from, _)| *from <= height)
            .map(|(_, epoch)| *epoch)
            .max()
            .unwrap_or(0)
    }

    fn block_at(&self, height: u64) -> BlockId {
        let mut hash = height.to_be_bytes().to_vec();
        hash.push(self.epoch_at(height));
        BlockId::new(height, hash)
    }

    fn is_canonical(&self, block: &BlockId) -> bool {
        self.block_at(block.height) == *block
    }
}

pub struct MockChainAdapter {
    chain_id: ChainId,
    id: String,
    capabilities: ChainCapabilities,
    auto_mine: u64,
    call_delay: Duration,
    finality_delay: Duration,
    state: Mutex<ChainState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockChainAdapter {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            id: format!("mock-{}-{}", chain_id, Uuid::new_v4()),
            capabilities: ChainCapabilities {
                finality: FinalityType::Probabilistic { confirmations: 2 },
                ..ChainCapabilities::default()
            },
            auto_mine: 1,
            call_delay: Duration::ZERO,
            finality_delay: Duration::ZERO,
            state: Mutex::new(ChainState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ChainCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn without_onchain_verification(mut self) -> Self {
        self.capabilities.supports_onchain_verification = false;
        self
    }

    pub fn with_batch_submission(mut self) -> Self {
        self.capabilities.supports_batch_submission = true;
        self
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.capabilities.finality = FinalityType::Probabilistic { confirmations };
        self
    }

    /// Blocks finalized per `latest_block` call.
    pub fn with_auto_mine(mut self, blocks: u64) -> Self {
        self.auto_mine = blocks;
        self
    }

    /// Latency added to every submission.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Time every `wait_for_finality` call takes.
    pub fn with_finality_delay(mut self, delay: Duration) -> Self {
        self.finality_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn script_submit_failures(&self, count: usize, failure: MockFailure) {
        self.state().submit_failures.extend(std::iter::repeat(failure).take(count));
    }

    pub fn script_verify_failures(&self, count: usize, failure: MockFailure) {
        self.state().verify_failures.extend(std::iter::repeat(failure).take(count));
    }

    pub fn script_health_failures(&self, count: u32) {
        self.state().health_failures += count;
    }

    /// The next `count` submissions are accepted but never included.
    pub fn drop_next_submissions(&self, count: u32) {
        self.state().drop_next += count;
    }

    /// Replaces every block from `height` on with a competing fork.
    pub fn reorg_from(&self, height: u64) {
        let mut state = self.state();
        let epoch = state.forks.iter().map(|(_, e)| *e).max().unwrap_or(0) + 1;
        state.forks.push((height, epoch));
    }

    pub fn advance(&self, blocks: u64) {
        self.state().head += blocks;
    }

    pub fn push_event(&self, event: MessageEvent) {
        self.state().events.push(event);
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    pub fn submit_calls(&self) -> u32 {
        self.state().submit_calls
    }

    pub fn batch_calls(&self) -> u32 {
        self.state().batch_calls
    }

    pub fn verify_calls(&self) -> u32 {
        self.state().verify_calls
    }

    /// Message ids in the order they were first accepted.
    pub fn submission_order(&self) -> Vec<Uuid> {
        self.state().submission_order.clone()
    }

    pub fn peak_concurrent_calls(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn tx_id_for(&self, id: &Uuid) -> TxId {
        let mut bytes = self.chain_id.tag().to_be_bytes().to_vec();
        bytes.extend_from_slice(id.as_bytes());
        TxId::new(bytes)
    }

    fn submit_now(&self, msg: &FrostMessage) -> Result<TxId, AdapterError> {
        let raw = codec::encode(msg)?;
        let tx = self.tx_id_for(&msg.id);
        let mut state = self.state();
        state.submit_calls += 1;

        if let Some(failure) = state.submit_failures.pop_front() {
            return Err(failure.into_error("submit_message"));
        }

        let dropped = state.drop_next > 0;
        if dropped {
            state.drop_next -= 1;
        }
        let next_block = state.block_at(state.head + 1);

        if let Some(record) = state.txs.get_mut(&msg.id) {
            if record.block.is_some() {
                return Err(AdapterError::AlreadySubmitted(record.tx.clone()));
            }
            if !dropped {
                record.block = Some(next_block);
            }
            return Ok(record.tx.clone());
        }

        state.txs.insert(
            msg.id,
            TxRecord {
                tx: tx.clone(),
                raw,
                block: (!dropped).then_some(next_block),
            },
        );
        state.submission_order.push(msg.id);
        Ok(tx)
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn adapter_id(&self) -> String {
        self.id.clone()
    }

    fn capabilities(&self) -> ChainCapabilities {
        self.capabilities.clone()
    }

    async fn latest_block(&self) -> Result<BlockId, AdapterError> {
        let mut state = self.state();
        state.head += self.auto_mine;
        Ok(state.block_at(state.head))
    }

    async fn get_transaction(&self, tx: &TxId) -> Result<Option<Vec<u8>>, AdapterError> {
        let state = self.state();
        Ok(state
            .txs
            .values()
            .find(|record| record.tx == *tx && record.block.is_some())
            .map(|record| record.raw.clone()))
    }

    async fn transaction_block(&self, tx: &TxId) -> Result<Option<BlockId>, AdapterError> {
        let mut state = self.state();
        let canonical_next = state.block_at(state.head + 1);
        let Some(id) = state.txs.iter().find(|(_, r)| r.tx == *tx).map(|(id, _)| *id) else {
            return Ok(None);
        };
        let reorged = state
            .txs
            .get(&id)
            .and_then(|record| record.block.as_ref())
            .is_some_and(|block| !state.is_canonical(block));

        match state.txs.get_mut(&id) {
            Some(record) => {
                if reorged {
                    // Back in the mempool, mined again on the new fork.
                    record.block = Some(canonical_next);
                }
                Ok(record.block.clone())
            }
            None => Ok(None),
        }
    }

    async fn wait_for_finality(&self, block: &BlockId) -> Result<(), AdapterError> {
        if !self.finality_delay.is_zero() {
            tokio::time::sleep(self.finality_delay).await;
        }
        let state = self.state();
        if !state.is_canonical(block) {
            return Err(AdapterError::Reorganized(block.clone()));
        }
        if state.head < block.height {
            return Err(AdapterError::FinalityTimeout(format!("block {} not yet final", block)));
        }
        Ok(())
    }

    async fn submit_message(&self, msg: &FrostMessage) -> Result<TxId, AdapterError> {
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.submit_now(msg)
    }

    async fn submit_batch(&self, msgs: &[FrostMessage]) -> Result<Vec<TxId>, AdapterError> {
        self.state().batch_calls += 1;
        let mut txs = Vec::with_capacity(msgs.len());
        for msg in msgs {
            txs.push(self.submit_message(msg).await?);
        }
        Ok(txs)
    }

    async fn listen_for_events(&self) -> Result<Vec<MessageEvent>, AdapterError> {
        let mut state = self.state();
        let events = std::mem::take(&mut state.events);
        Ok(events
            .into_iter()
            .filter(|event| event.block.as_ref().map_or(true, |b| state.is_canonical(b)))
            .collect())
    }

    async fn verify_on_chain(&self, msg: &FrostMessage) -> Result<(), AdapterError> {
        let mut state = self.state();
        state.verify_calls += 1;
        if let Some(failure) = state.verify_failures.pop_front() {
            return Err(failure.into_error("verify_on_chain"));
        }
        if !self.capabilities.supports_onchain_verification {
            return Err(AdapterError::Unsupported("verify_on_chain".to_string()));
        }
        match msg.proof {
            Some(ref proof) if !proof.is_empty() => Ok(()),
            _ => Err(AdapterError::Rejected(format!("message {} carries no proof", msg.id))),
        }
    }

    async fn estimate_fee(&self, msg: &FrostMessage) -> Result<u128, AdapterError> {
        Ok(21_000 + msg.payload.len() as u128 * 16)
    }

    async fn message_status(&self, id: &Uuid) -> Result<ChainMessageStatus, AdapterError> {
        let state = self.state();
        let depth = self.capabilities.finality.depth();
        Ok(match state.txs.get(id) {
            None => ChainMessageStatus::Unknown,
            Some(TxRecord { block: None, .. }) => ChainMessageStatus::Pending,
            Some(TxRecord { block: Some(block), .. }) if !state.is_canonical(block) => {
                ChainMessageStatus::Pending
            }
            Some(TxRecord { block: Some(block), .. }) if state.head >= block.height + depth => {
                ChainMessageStatus::Confirmed
            }
            Some(_) => ChainMessageStatus::InFlight,
        })
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let mut state = self.state();
        if state.health_failures > 0 {
            state.health_failures -= 1;
            return Err(MockFailure::Connectivity.into_error("health_check"));
        }
        Ok(())
    }
}

const MOCK_PROOF_TAG: &[u8] = b"mock";

fn mock_proof_bytes(input: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(input);
    let mut bytes = MOCK_PROOF_TAG.to_vec();
    bytes.extend_from_slice(&hasher.finalize());
    bytes
}

/// Proof backend whose proofs are a tagged hash of the input.
pub struct MockProofBackend {
    delay: Duration,
    failures: Mutex<VecDeque<ProofError>>,
    reject_verification: AtomicBool,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    executions: AtomicU32,
    key_fetches: AtomicU32,
}

impl Default for MockProofBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProofBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            reject_verification: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            executions: AtomicU32::new(0),
            key_fetches: AtomicU32::new(0),
        }
    }

    /// Time every proof takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script_failures(&self, count: usize, error: ProofError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(std::iter::repeat(error).take(count));
        }
    }

    /// Makes `verify` return false for every proof.
    pub fn reject_verification(&self) {
        self.reject_verification.store(true, Ordering::SeqCst);
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn key_fetches(&self) -> u32 {
        self.key_fetches.load(Ordering::SeqCst)
    }

    pub fn peak_active_jobs(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofBackend for MockProofBackend {
    fn backend_id(&self) -> String {
        "mock-prover".to_string()
    }

    fn proof_kind(&self) -> ProofKind {
        ProofKind::ZeroKnowledge
    }

    async fn execute(&self, _program: &[u8], input: &[u8]) -> Result<ProofData, ProofError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let scripted = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        let _job = InFlight::enter(&self.active, &self.peak_active);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ProofData::ZeroKnowledge(mock_proof_bytes(input)))
    }

    async fn verify(&self, proof: &ProofData, input: Option<&[u8]>) -> Result<bool, ProofError> {
        if self.reject_verification.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let ProofData::ZeroKnowledge(bytes) = proof else {
            return Ok(false);
        };
        Ok(match input {
            Some(input) => *bytes == mock_proof_bytes(input),
            None => bytes.starts_with(MOCK_PROOF_TAG) && bytes.len() == MOCK_PROOF_TAG.len() + 32,
        })
    }

    async fn get_keys(&self) -> Result<BackendKeys, ProofError> {
        self.key_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(BackendKeys {
            proving_key: b"mock-pk".to_vec(),
            verifying_key: b"mock-vk".to_vec(),
        })
    }

    async fn get_resource_usage(&self) -> ResourceUsage {
        ResourceUsage {
            active_jobs: self.active.load(Ordering::SeqCst),
            ..ResourceUsage::default()
        }
    }
}
