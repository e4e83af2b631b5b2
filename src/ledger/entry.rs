use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frostmessage::{ChainId, FrostMessage, MessageStatus, ReplayKey, TxId};
use crate::utils::unix_timestamp;

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: MessageStatus,
    /// Seconds since the unix epoch
    pub at: u64,
}

/// Pipeline stage a retry was spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStage {
    Submission,
    Finality,
    Proving,
    DestinationSubmission,
    Verification,
}

impl fmt::Display for RetryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryStage::Submission => "submission",
            RetryStage::Finality => "finality",
            RetryStage::Proving => "proving",
            RetryStage::DestinationSubmission => "destination submission",
            RetryStage::Verification => "verification",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub submission: u32,
    pub finality: u32,
    pub proving: u32,
    pub destination_submission: u32,
    pub verification: u32,
}

impl RetryCounters {
    pub fn increment(&mut self, stage: RetryStage) {
        let counter = match stage {
            RetryStage::Submission => &mut self.submission,
            RetryStage::Finality => &mut self.finality,
            RetryStage::Proving => &mut self.proving,
            RetryStage::DestinationSubmission => &mut self.destination_submission,
            RetryStage::Verification => &mut self.verification,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn total(&self) -> u32 {
        self.submission
            .saturating_add(self.finality)
            .saturating_add(self.proving)
            .saturating_add(self.destination_submission)
            .saturating_add(self.verification)
    }
}

/// Audit record of one relayed message. Entries are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub key: ReplayKey,
    pub nonce: u64,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub status: MessageStatus,
    pub history: Vec<StatusTransition>,
    pub source_tx: Option<TxId>,
    pub destination_tx: Option<TxId>,
    pub retries: RetryCounters,
    pub last_error: Option<String>,
    pub created_at: u64,
}

impl LedgerEntry {
    pub(crate) fn reserved(message: &FrostMessage) -> Self {
        let now = unix_timestamp();
        Self {
            id: message.id,
            key: message.replay_key(),
            nonce: message.nonce,
            source_chain: message.source_chain,
            destination_chain: message.destination_chain,
            status: MessageStatus::Created,
            history: vec![StatusTransition {
                status: MessageStatus::Created,
                at: now,
            }],
            source_tx: None,
            destination_tx: None,
            retries: RetryCounters::default(),
            last_error: None,
            created_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the message ever reached `status`.
    pub fn has_visited(&self, status: &MessageStatus) -> bool {
        self.history.iter().any(|t| t.status == *status)
    }
}
