use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BackendKeys, ProofBackend, ProofError, ResourceUsage};
use crate::frostmessage::ProofData;

/// Pool-side accounting of proving work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_proving_time: Duration,
}

/// Decrements the counter when dropped, including when the owning future is.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded access to one proof backend.
///
/// At most `capacity` proofs run at once; further requests wait for a slot.
/// Cancelling a request, queued or running, drops the backend future and
/// frees its slot.
pub struct ProvingPool {
    backend: Arc<dyn ProofBackend>,
    slots: Semaphore,
    capacity: usize,
    keys: OnceCell<BackendKeys>,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    proving_time: Mutex<Duration>,
}

impl ProvingPool {
    pub fn new(backend: Arc<dyn ProofBackend>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            backend,
            slots: Semaphore::new(capacity),
            capacity,
            keys: OnceCell::new(),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            proving_time: Mutex::new(Duration::ZERO),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ProofBackend> {
        &self.backend
    }

    /// Runs one proof, waiting for a free slot first.
    pub async fn execute(
        &self,
        program: &[u8],
        input: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProofData, ProofError> {
        let queued = Gauge::enter(&self.queued);
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(ProofError::Cancelled);
            }
            permit = self.slots.acquire() => permit
                .map_err(|_| ProofError::Backend("proving pool closed".to_string()))?,
        };
        drop(queued);

        let _active = Gauge::enter(&self.active);
        let started = Instant::now();
        debug!(backend = %self.backend.backend_id(), "Proving started");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProofError::Cancelled),
            result = self.backend.execute(program, input) => result,
        };

        let elapsed = started.elapsed();
        if let Ok(mut total) = self.proving_time.lock() {
            *total += elapsed;
        }
        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                debug!(backend = %self.backend.backend_id(), ?elapsed, "Proving finished");
            }
            Err(ProofError::Cancelled) => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                debug!(backend = %self.backend.backend_id(), "Proving cancelled");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(backend = %self.backend.backend_id(), "Proving failed: {}", e);
            }
        }
        result
    }

    pub async fn verify(&self, proof: &ProofData, input: Option<&[u8]>) -> Result<bool, ProofError> {
        self.backend.verify(proof, input).await
    }

    /// Backend keys, fetched on first use.
    pub async fn keys(&self) -> Result<&BackendKeys, ProofError> {
        self.keys.get_or_try_init(|| self.backend.get_keys()).await
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            capacity: self.capacity,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            total_proving_time: self.proving_time.lock().map(|t| *t).unwrap_or_default(),
        }
    }

    pub async fn backend_usage(&self) -> ResourceUsage {
        self.backend.get_resource_usage().await
    }
}
