use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a message ended in [`MessageStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Submission (or re-submission after a finality timeout) ran out of attempts.
    SubmissionExhausted,
    /// The proof backend stayed overloaded for every attempt.
    ProvingExhausted,
    /// On-chain verification kept failing transiently.
    VerificationExhausted,
    /// The backend or the destination chain definitively rejected the proof.
    ProofRejected,
    /// The destination chain cannot verify proofs on-chain.
    VerificationUnsupported,
    /// Malformed data or a protocol mismatch; retrying cannot help.
    Protocol(String),
    /// Cancelled externally, by shutdown, or because a reorg superseded the message.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SubmissionExhausted => f.write_str("submission attempts exhausted"),
            FailureReason::ProvingExhausted => f.write_str("proving attempts exhausted"),
            FailureReason::VerificationExhausted => f.write_str("verification attempts exhausted"),
            FailureReason::ProofRejected => f.write_str("proof rejected"),
            FailureReason::VerificationUnsupported => {
                f.write_str("on-chain verification unsupported")
            }
            FailureReason::Protocol(reason) => write!(f, "protocol error: {}", reason),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Pipeline progress of a relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Created,
    SubmittedSource,
    AwaitingSourceFinality,
    Proving,
    SubmittedDestination,
    AwaitingDestinationFinality,
    Verified,
    Failed(FailureReason),
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Verified | MessageStatus::Failed(_))
    }

    /// Whether the pipeline may move from `self` to `next`.
    ///
    /// Resubmission after a finality timeout moves a message back from
    /// `Awaiting*Finality` to `Submitted*`.
    pub fn can_transition_to(&self, next: &MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Verified, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Created, SubmittedSource) => true,
            (SubmittedSource, AwaitingSourceFinality) => true,
            (AwaitingSourceFinality, SubmittedSource) => true,
            (AwaitingSourceFinality, Proving) => true,
            (Proving, SubmittedDestination) => true,
            (SubmittedDestination, AwaitingDestinationFinality) => true,
            (AwaitingDestinationFinality, SubmittedDestination) => true,
            (AwaitingDestinationFinality, Verified) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Created => f.write_str("created"),
            MessageStatus::SubmittedSource => f.write_str("submitted to source"),
            MessageStatus::AwaitingSourceFinality => f.write_str("awaiting source finality"),
            MessageStatus::Proving => f.write_str("proving"),
            MessageStatus::SubmittedDestination => f.write_str("submitted to destination"),
            MessageStatus::AwaitingDestinationFinality => {
                f.write_str("awaiting destination finality")
            }
            MessageStatus::Verified => f.write_str("verified"),
            MessageStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A single chain's local view of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainMessageStatus {
    Pending,
    InFlight,
    Confirmed,
    Failed(String),
    Unknown,
}
