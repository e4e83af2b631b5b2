//! Frostgate relay core
//!
//! Drives application messages from a source chain, through proof
//! generation, to verification on a destination chain. Chains and proof
//! systems plug in through the [`ChainAdapter`] and [`ProofBackend`] traits;
//! the [`RelayOrchestrator`] owns retries, finality tracking and replay
//! protection.

pub mod chainadapter;
pub mod error;
pub mod finality;
pub mod frostmessage;
pub mod ledger;
pub mod registry;
pub mod relay;
pub mod types;
pub mod utils;
pub mod zkplug;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use chainadapter::{AdapterError, ChainAdapter, ChainCapabilities, FinalityType};
pub use error::RelayError;
pub use finality::{FinalityError, FinalityTracker};
pub use frostmessage::{
    BlockId, ChainId, ChainMessageStatus, FailureReason, FrostMessage, MessageEvent, MessageStatus, ProofData,
    ReplayKey, TxId,
};
pub use ledger::{Ledger, LedgerEntry, LedgerError};
pub use registry::{AdapterRegistry, RegistryConfig, RegistryError};
pub use relay::{RelayConfig, RelayHandle, RelayOrchestrator, StatusReport};
pub use types::{ConnectionStatus, HealthMetrics};
pub use zkplug::{ProofBackend, ProofError, ProvingPool};

pub type Result<T> = std::result::Result<T, RelayError>;
