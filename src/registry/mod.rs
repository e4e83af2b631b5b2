mod config;
pub use config::RegistryConfig;

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chainadapter::ChainAdapter;
use crate::finality::{FinalityConfig, FinalityTracker};
use crate::frostmessage::ChainId;
use crate::types::{ConnectionStatus, HealthMetrics};

/// Errors that can occur when working with the adapter registry
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Adapter for chain {0} already registered")]
    AlreadyRegistered(ChainId),

    #[error("No adapter registered for chain {0}")]
    NotFound(ChainId),

    #[error("Adapter for chain {0} is disabled")]
    Disabled(ChainId),

    #[error("Adapter for chain {0} is shutting down")]
    Closed(ChainId),
}

/// Registry entry for a chain adapter
struct RegistryEntry {
    adapter: Arc<dyn ChainAdapter>,
    /// Bounds outstanding calls to this chain
    permits: Arc<Semaphore>,
    registered_at: SystemTime,
    health_metrics: HealthMetrics,
    enabled: bool,
}

/// Adapter handle holding one of the chain's call slots until dropped.
pub struct AdapterLease {
    adapter: Arc<dyn ChainAdapter>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for AdapterLease {
    type Target = dyn ChainAdapter;

    fn deref(&self) -> &Self::Target {
        self.adapter.as_ref()
    }
}

/// Point-in-time view of one registered adapter.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub chain_id: ChainId,
    pub adapter_id: String,
    pub enabled: bool,
    pub registered_at: SystemTime,
    pub health: HealthMetrics,
}

/// Thread-safe registry of chain adapters, one per chain.
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<ChainId, RegistryEntry>>,
    config: RegistryConfig,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn entry_for(&self, adapter: Arc<dyn ChainAdapter>) -> RegistryEntry {
        RegistryEntry {
            adapter,
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_calls.max(1))),
            registered_at: SystemTime::now(),
            health_metrics: HealthMetrics::default(),
            enabled: true,
        }
    }

    /// Registers the adapter under its own chain id.
    ///
    /// Returns an error if an adapter for this chain already exists
    pub async fn register_adapter(&self, adapter: Arc<dyn ChainAdapter>) -> Result<(), RegistryError> {
        let chain_id = adapter.chain_id();
        let mut adapters = self.adapters.write().await;

        if adapters.contains_key(&chain_id) {
            return Err(RegistryError::AlreadyRegistered(chain_id));
        }

        info!("Registering adapter {} for chain {}", adapter.adapter_id(), chain_id);
        adapters.insert(chain_id, self.entry_for(adapter));
        Ok(())
    }

    /// Registers or replaces the adapter for its chain, returning the previous one.
    pub async fn register_or_update_adapter(
        &self,
        adapter: Arc<dyn ChainAdapter>,
    ) -> Option<Arc<dyn ChainAdapter>> {
        let chain_id = adapter.chain_id();
        let mut adapters = self.adapters.write().await;
        info!("Registering adapter {} for chain {}", adapter.adapter_id(), chain_id);
        adapters
            .insert(chain_id, self.entry_for(adapter))
            .map(|previous| previous.adapter)
    }

    /// Bulk register multiple adapters
    ///
    /// Nothing is registered if any chain already has an adapter.
    pub async fn bulk_register(&self, batch: Vec<Arc<dyn ChainAdapter>>) -> Result<(), RegistryError> {
        let mut adapters = self.adapters.write().await;

        for (i, adapter) in batch.iter().enumerate() {
            let chain_id = adapter.chain_id();
            let repeated = batch[..i].iter().any(|a| a.chain_id() == chain_id);
            if repeated || adapters.contains_key(&chain_id) {
                return Err(RegistryError::AlreadyRegistered(chain_id));
            }
        }

        for adapter in batch {
            info!("Registering adapter {} for chain {}", adapter.adapter_id(), adapter.chain_id());
            adapters.insert(adapter.chain_id(), self.entry_for(adapter));
        }
        Ok(())
    }

    /// Removes an adapter, closing its call slots.
    pub async fn remove_adapter(&self, chain_id: &ChainId) -> Option<Arc<dyn ChainAdapter>> {
        let mut adapters = self.adapters.write().await;
        adapters.remove(chain_id).map(|entry| {
            entry.permits.close();
            info!("Removed adapter {} for chain {}", entry.adapter.adapter_id(), chain_id);
            entry.adapter
        })
    }

    /// Retrieves the adapter for a chain regardless of its health.
    pub async fn get_adapter(&self, chain_id: &ChainId) -> Result<Arc<dyn ChainAdapter>, RegistryError> {
        let adapters = self.adapters.read().await;
        adapters
            .get(chain_id)
            .map(|entry| entry.adapter.clone())
            .ok_or(RegistryError::NotFound(*chain_id))
    }

    pub async fn has_adapter(&self, chain_id: &ChainId) -> bool {
        self.adapters.read().await.contains_key(chain_id)
    }

    pub async fn list_chain_ids(&self) -> Vec<ChainId> {
        self.adapters.read().await.keys().copied().collect()
    }

    pub async fn count(&self) -> usize {
        self.adapters.read().await.len()
    }

    pub async fn summaries(&self) -> Vec<AdapterSummary> {
        let adapters = self.adapters.read().await;
        adapters
            .iter()
            .map(|(chain_id, entry)| AdapterSummary {
                chain_id: *chain_id,
                adapter_id: entry.adapter.adapter_id(),
                enabled: entry.enabled,
                registered_at: entry.registered_at,
                health: entry.health_metrics.clone(),
            })
            .collect()
    }

    /// Whether new work may be routed to this chain.
    pub async fn is_healthy(&self, chain_id: &ChainId) -> bool {
        let adapters = self.adapters.read().await;
        adapters.get(chain_id).is_some_and(|entry| {
            entry.enabled && entry.health_metrics.connection_status != ConnectionStatus::Unhealthy
        })
    }

    /// Waits for one of the chain's call slots.
    ///
    /// Disabled adapters are still leased: in-flight work that already
    /// depends on a chain keeps going, only new admissions are refused.
    pub async fn acquire(&self, chain_id: &ChainId) -> Result<AdapterLease, RegistryError> {
        let (adapter, permits) = {
            let adapters = self.adapters.read().await;
            let entry = adapters.get(chain_id).ok_or(RegistryError::NotFound(*chain_id))?;
            (entry.adapter.clone(), entry.permits.clone())
        };

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| RegistryError::Closed(*chain_id))?;

        Ok(AdapterLease {
            adapter,
            _permit: permit,
        })
    }

    /// Finality tracker for a chain whose polls share the chain's call slots.
    pub async fn finality_tracker(
        &self,
        chain_id: &ChainId,
        config: &FinalityConfig,
    ) -> Result<FinalityTracker, RegistryError> {
        let adapters = self.adapters.read().await;
        let entry = adapters.get(chain_id).ok_or(RegistryError::NotFound(*chain_id))?;
        Ok(FinalityTracker::new(entry.adapter.clone(), config).with_call_limit(entry.permits.clone()))
    }

    /// Folds the outcome of one adapter call into the chain's health metrics.
    pub async fn record_call(&self, chain_id: &ChainId, success: bool, elapsed: Duration) {
        let mut adapters = self.adapters.write().await;
        if let Some(entry) = adapters.get_mut(chain_id) {
            self.apply_outcome(chain_id, entry, success, elapsed);
        }
    }

    fn apply_outcome(&self, chain_id: &ChainId, entry: &mut RegistryEntry, success: bool, elapsed: Duration) {
        entry.health_metrics.record(
            success,
            elapsed,
            self.config.max_consecutive_failures,
            self.config.max_response_time,
        );

        match entry.health_metrics.connection_status {
            ConnectionStatus::Unhealthy if entry.enabled => {
                warn!(
                    "Disabling adapter {} for chain {} after {} consecutive failures",
                    entry.adapter.adapter_id(),
                    chain_id,
                    entry.health_metrics.consecutive_failures
                );
                entry.enabled = false;
            }
            ConnectionStatus::Healthy if !entry.enabled && self.config.auto_reenable => {
                info!("Re-enabling healthy adapter {} for chain {}", entry.adapter.adapter_id(), chain_id);
                entry.enabled = true;
            }
            ConnectionStatus::Degraded => {
                debug!("Adapter for chain {} degraded", chain_id);
            }
            _ => {}
        }
    }

    /// Run health checks on all adapters concurrently.
    pub async fn run_health_checks(&self) {
        let targets: Vec<(ChainId, Arc<dyn ChainAdapter>)> = {
            let adapters = self.adapters.read().await;
            adapters
                .iter()
                .map(|(chain_id, entry)| (*chain_id, entry.adapter.clone()))
                .collect()
        };

        let outcomes = futures::future::join_all(targets.into_iter().map(|(chain_id, adapter)| async move {
            let start = Instant::now();
            let result = adapter.health_check().await;
            (chain_id, result, start.elapsed())
        }))
        .await;

        let mut adapters = self.adapters.write().await;
        for (chain_id, result, elapsed) in outcomes {
            let Some(entry) = adapters.get_mut(&chain_id) else {
                continue;
            };
            if let Err(e) = &result {
                warn!("Health check failed for chain {}: {}", chain_id, e);
            }
            self.apply_outcome(&chain_id, entry, result.is_ok(), elapsed);
        }
    }

    /// Start the health check background task
    pub fn start_health_checks(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Stopping adapter health checks");
                        break;
                    }
                    _ = interval.tick() => self.run_health_checks().await,
                }
            }
        })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("config", &self.config)
            .field("adapters", &"<opaque>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frostmessage::FrostMessage;
    use crate::mock::MockChainAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arc(adapter: MockChainAdapter) -> Arc<MockChainAdapter> {
        Arc::new(adapter)
    }

    #[tokio::test]
    async fn test_register_and_get_adapter() {
        let registry = AdapterRegistry::new();
        let adapter = arc(MockChainAdapter::new(ChainId::Ethereum));

        registry.register_adapter(adapter.clone()).await.unwrap();
        let retrieved = registry.get_adapter(&ChainId::Ethereum).await.unwrap();
        assert_eq!(retrieved.adapter_id(), adapter.adapter_id());
        assert!(registry.is_healthy(&ChainId::Ethereum).await);
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = AdapterRegistry::new();
        registry.register_adapter(arc(MockChainAdapter::new(ChainId::Ethereum))).await.unwrap();
        let result = registry.register_adapter(arc(MockChainAdapter::new(ChainId::Ethereum))).await;
        assert_eq!(result, Err(RegistryError::AlreadyRegistered(ChainId::Ethereum)));
    }

    #[tokio::test]
    async fn test_register_or_update() {
        let registry = AdapterRegistry::new();
        let first = arc(MockChainAdapter::new(ChainId::Ethereum));
        let second = arc(MockChainAdapter::new(ChainId::Ethereum));

        assert!(registry.register_or_update_adapter(first.clone()).await.is_none());
        let replaced = registry.register_or_update_adapter(second.clone()).await.unwrap();
        assert_eq!(replaced.adapter_id(), first.adapter_id());

        let current = registry.get_adapter(&ChainId::Ethereum).await.unwrap();
        assert_eq!(current.adapter_id(), second.adapter_id());
    }

    #[tokio::test]
    async fn test_nonexistent_adapter() {
        let registry = AdapterRegistry::new();
        let result = registry.get_adapter(&ChainId::Ethereum).await;
        assert!(matches!(result, Err(RegistryError::NotFound(ChainId::Ethereum))));
        assert!(registry.acquire(&ChainId::Ethereum).await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_register_is_all_or_nothing() {
        let registry = AdapterRegistry::new();
        registry.register_adapter(arc(MockChainAdapter::new(ChainId::Solana))).await.unwrap();

        let batch: Vec<Arc<dyn ChainAdapter>> = vec![
            arc(MockChainAdapter::new(ChainId::Ethereum)),
            arc(MockChainAdapter::new(ChainId::Solana)),
        ];
        assert!(registry.bulk_register(batch).await.is_err());
        assert!(!registry.has_adapter(&ChainId::Ethereum).await);

        let batch: Vec<Arc<dyn ChainAdapter>> = vec![
            arc(MockChainAdapter::new(ChainId::Ethereum)),
            arc(MockChainAdapter::new(ChainId::Polkadot)),
        ];
        registry.bulk_register(batch).await.unwrap();

        let mut chain_ids = registry.list_chain_ids().await;
        chain_ids.sort();
        assert_eq!(chain_ids, vec![ChainId::Ethereum, ChainId::Polkadot, ChainId::Solana]);
    }

    #[tokio::test]
    async fn test_failing_health_checks_disable_then_reenable() {
        let config = RegistryConfig::default().with_max_consecutive_failures(2);
        let registry = AdapterRegistry::with_config(config);
        let adapter = arc(MockChainAdapter::new(ChainId::Polkadot));
        registry.register_adapter(adapter.clone()).await.unwrap();

        adapter.script_health_failures(2);
        registry.run_health_checks().await;
        assert!(registry.is_healthy(&ChainId::Polkadot).await);
        registry.run_health_checks().await;
        assert!(!registry.is_healthy(&ChainId::Polkadot).await);

        // Leases still work for in-flight callers.
        assert!(registry.acquire(&ChainId::Polkadot).await.is_ok());

        registry.run_health_checks().await;
        assert!(registry.is_healthy(&ChainId::Polkadot).await);
    }

    #[tokio::test]
    async fn test_strict_config_keeps_adapter_disabled() {
        let registry = AdapterRegistry::with_config(RegistryConfig::strict());
        let adapter = arc(MockChainAdapter::new(ChainId::Sui));
        registry.register_adapter(adapter.clone()).await.unwrap();

        registry.record_call(&ChainId::Sui, false, Duration::from_millis(5)).await;
        registry.record_call(&ChainId::Sui, false, Duration::from_millis(5)).await;
        assert!(!registry.is_healthy(&ChainId::Sui).await);

        registry.record_call(&ChainId::Sui, true, Duration::from_millis(5)).await;
        assert!(!registry.is_healthy(&ChainId::Sui).await);
    }

    #[tokio::test]
    async fn test_leases_bound_concurrent_calls() {
        let registry = Arc::new(AdapterRegistry::with_config(
            RegistryConfig::default().with_max_concurrent_calls(2),
        ));
        let adapter = arc(MockChainAdapter::new(ChainId::Ethereum).with_call_delay(Duration::from_millis(20)));
        registry.register_adapter(adapter.clone()).await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..6u64 {
            let registry = registry.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                let lease = registry.acquire(&ChainId::Ethereum).await.unwrap();
                let msg = FrostMessage::new(ChainId::Ethereum, ChainId::Polkadot, vec![], i);
                lease.submit_message(&msg).await.unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(adapter.peak_concurrent_calls() <= 2);
    }

    #[tokio::test]
    async fn test_remove_adapter_closes_leases() {
        let registry = AdapterRegistry::new();
        registry.register_adapter(arc(MockChainAdapter::new(ChainId::Ethereum))).await.unwrap();
        assert!(registry.remove_adapter(&ChainId::Ethereum).await.is_some());
        assert_eq!(registry.count().await, 0);
    }
}
