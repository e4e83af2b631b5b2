use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{lease, record_outcome, RelayContext};
use crate::chainadapter::{accept_duplicate, AdapterError};
use crate::frostmessage::{BlockId, ChainId, FailureReason, FrostMessage, MessageStatus, ProofData, TxId};
use crate::ledger::RetryStage;
use crate::utils::retry_async;
use crate::zkplug::{ProofError, ProvingInput};

/// Which chain a submission goes to.
#[derive(Debug, Clone, Copy)]
enum Leg {
    Source,
    Destination,
}

impl Leg {
    fn chain(self, message: &FrostMessage) -> ChainId {
        match self {
            Leg::Source => message.source_chain,
            Leg::Destination => message.destination_chain,
        }
    }

    fn submitted(self) -> MessageStatus {
        match self {
            Leg::Source => MessageStatus::SubmittedSource,
            Leg::Destination => MessageStatus::SubmittedDestination,
        }
    }

    fn awaiting_finality(self) -> MessageStatus {
        match self {
            Leg::Source => MessageStatus::AwaitingSourceFinality,
            Leg::Destination => MessageStatus::AwaitingDestinationFinality,
        }
    }

    fn retry_stage(self) -> RetryStage {
        match self {
            Leg::Source => RetryStage::Submission,
            Leg::Destination => RetryStage::DestinationSubmission,
        }
    }
}

/// Drives one admitted message to a terminal status.
pub(crate) struct Workflow {
    ctx: Arc<RelayContext>,
    message: FrostMessage,
    cancel: CancellationToken,
}

impl Workflow {
    pub(crate) fn new(ctx: Arc<RelayContext>, message: FrostMessage, cancel: CancellationToken) -> Self {
        Self { ctx, message, cancel }
    }

    #[instrument(
        name = "relay_workflow",
        skip(self),
        fields(
            message_id = %self.message.id,
            source = %self.message.source_chain,
            destination = %self.message.destination_chain,
        )
    )]
    pub(crate) async fn run(self) -> MessageStatus {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FailureReason::Cancelled),
            outcome = self.drive() => outcome,
        };

        let status = match outcome {
            Ok(()) => MessageStatus::Verified,
            Err(reason) => MessageStatus::Failed(reason),
        };
        match &status {
            MessageStatus::Verified => info!("Message verified on {}", self.message.destination_chain),
            MessageStatus::Failed(FailureReason::Cancelled) => warn!("Message cancelled"),
            MessageStatus::Failed(reason) => error!("Message failed: {}", reason),
            _ => {}
        }

        if let Err(e) = self.ctx.ledger.record_status(&self.message.id, status.clone()).await {
            error!("Failed to record final status: {}", e);
        }
        status
    }

    async fn drive(&self) -> Result<(), FailureReason> {
        let (source_tx, source_block) = self.submit_until_final(Leg::Source, &self.message).await?;
        let proof = self.prove(source_tx, source_block).await?;

        let mut outbound = self.message.clone();
        outbound
            .attach_proof(proof)
            .map_err(|e| FailureReason::Protocol(e.to_string()))?;

        self.submit_until_final(Leg::Destination, &outbound).await?;
        self.verify_on_destination(&outbound).await
    }

    async fn advance(&self, status: MessageStatus) -> Result<(), FailureReason> {
        self.ctx
            .ledger
            .record_status(&self.message.id, status.clone())
            .await
            .map_err(|e| FailureReason::Protocol(e.to_string()))?;
        info!("Message {}", status);
        Ok(())
    }

    async fn note_retry(&self, stage: RetryStage, error: String) {
        if let Err(e) = self.ctx.ledger.record_retry(&self.message.id, stage).await {
            debug!("Could not count {} retry: {}", stage, e);
        }
        self.note_error(error).await;
    }

    async fn note_error(&self, error: String) {
        if let Err(e) = self.ctx.ledger.record_error(&self.message.id, error).await {
            debug!("Could not record error: {}", e);
        }
    }

    async fn submit(&self, leg: Leg, chain: ChainId, message: &FrostMessage) -> Result<TxId, AdapterError> {
        match leg {
            Leg::Source => self.ctx.ledger.wait_for_turn(&message.replay_key(), message.nonce).await,
            Leg::Destination => {
                if let Some(queue) = self.ctx.batch_queue(&chain).await {
                    return queue.submit(message.clone()).await;
                }
            }
        }

        let adapter = lease(&self.ctx.registry, &chain).await?;
        let started = Instant::now();
        let result = accept_duplicate(adapter.submit_message(message).await);
        drop(adapter);
        record_outcome(&self.ctx.registry, &chain, &result, started).await;
        result
    }

    /// Submits `message` and waits for its inclusion to become final.
    ///
    /// A finality timeout means the chain may have dropped the transaction,
    /// so it is resubmitted. Submission failures and resubmissions draw on
    /// the same attempt budget.
    async fn submit_until_final(&self, leg: Leg, message: &FrostMessage) -> Result<(TxId, BlockId), FailureReason> {
        let chain = leg.chain(message);
        let retry = &self.ctx.config.retry;
        let backoff = retry.backoff();
        let tracker = self
            .ctx
            .registry
            .finality_tracker(&chain, &self.ctx.config.finality)
            .await
            .map_err(|e| FailureReason::Protocol(e.to_string()))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempts_left = attempt < retry.max_attempts;

            let tx = match self.submit(leg, chain, message).await {
                Ok(tx) => tx,
                Err(e) if e.is_retryable() && attempts_left => {
                    warn!(%chain, attempt, "Submission failed, retrying: {}", e);
                    self.note_retry(leg.retry_stage(), e.to_string()).await;
                    sleep(backoff.delay(attempt)).await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    self.note_error(e.to_string()).await;
                    return Err(FailureReason::SubmissionExhausted);
                }
                Err(e) => {
                    self.note_error(e.to_string()).await;
                    return Err(FailureReason::Protocol(e.to_string()));
                }
            };

            let recorded = match leg {
                Leg::Source => self.ctx.ledger.record_source_tx(&message.id, tx.clone()).await,
                Leg::Destination => self.ctx.ledger.record_destination_tx(&message.id, tx.clone()).await,
            };
            recorded.map_err(|e| FailureReason::Protocol(e.to_string()))?;
            self.advance(leg.submitted()).await?;
            self.advance(leg.awaiting_finality()).await?;

            match tracker.wait_for_transaction(&tx).await {
                Ok(block) => {
                    debug!(%chain, "Transaction {} final in block {}", tx, block);
                    return Ok((tx, block));
                }
                Err(e) if e.is_retryable() && attempts_left => {
                    warn!(%chain, attempt, "Transaction {} not final, resubmitting: {}", tx, e);
                    self.note_retry(RetryStage::Finality, e.to_string()).await;
                    sleep(backoff.delay(attempt)).await;
                }
                Err(e) if e.is_retryable() => {
                    self.note_error(e.to_string()).await;
                    return Err(FailureReason::SubmissionExhausted);
                }
                Err(e) => {
                    self.note_error(e.to_string()).await;
                    return Err(FailureReason::Protocol(e.to_string()));
                }
            }
        }
    }

    /// Proves that the message was finalized on its source chain and checks
    /// the proof locally before anything trusts it.
    async fn prove(&self, source_tx: TxId, source_block: BlockId) -> Result<ProofData, FailureReason> {
        self.advance(MessageStatus::Proving).await?;

        let input = ProvingInput::new(&self.message, source_tx, source_block)
            .to_bytes()
            .map_err(|e| {
                error!("Cannot encode proving input: {}", e);
                FailureReason::ProofRejected
            })?;

        let retry = &self.ctx.config.retry;
        let this = self;
        let input_ref = &input;
        let result = retry_async(
            move |attempt| async move {
                if attempt > 1 {
                    warn!(attempt, "Retrying proof generation");
                    this.note_retry(RetryStage::Proving, "proof backend busy".to_string()).await;
                }
                this.ctx.pool.execute(&this.ctx.program, input_ref, &this.cancel).await
            },
            retry.max_attempts,
            retry.backoff(),
            ProofError::is_retryable,
        )
        .await;

        let proof = match result {
            Ok(proof) => proof,
            Err(ProofError::Cancelled) => return Err(FailureReason::Cancelled),
            Err(e) if e.is_retryable() => {
                self.note_error(e.to_string()).await;
                return Err(FailureReason::ProvingExhausted);
            }
            Err(e) => {
                self.note_error(e.to_string()).await;
                return Err(FailureReason::ProofRejected);
            }
        };

        match self.ctx.pool.verify(&proof, Some(&input)).await {
            Ok(true) => Ok(proof),
            Ok(false) => {
                warn!("Fresh {} proof failed local verification", proof.kind());
                self.note_error("proof failed local verification".to_string()).await;
                Err(FailureReason::ProofRejected)
            }
            Err(e) => {
                self.note_error(e.to_string()).await;
                Err(FailureReason::ProofRejected)
            }
        }
    }

    /// Only the destination chain accepting the proof makes a message verified.
    async fn verify_on_destination(&self, outbound: &FrostMessage) -> Result<(), FailureReason> {
        let chain = outbound.destination_chain;
        let retry = &self.ctx.config.retry;
        let this = self;

        let result = retry_async(
            move |attempt| async move {
                if attempt > 1 {
                    this.note_retry(RetryStage::Verification, "on-chain verification failed".to_string()).await;
                }
                let adapter = lease(&this.ctx.registry, &chain).await?;
                let started = Instant::now();
                let result = adapter.verify_on_chain(outbound).await;
                drop(adapter);
                record_outcome(&this.ctx.registry, &chain, &result, started).await;
                if let Err(e) = &result {
                    warn!(%chain, attempt, "On-chain verification failed: {}", e);
                }
                result
            },
            retry.max_attempts,
            retry.backoff(),
            AdapterError::is_retryable,
        )
        .await;

        let reason = match result {
            Ok(()) => return Ok(()),
            Err(AdapterError::Rejected(_)) => FailureReason::ProofRejected,
            Err(AdapterError::Unsupported(_)) => FailureReason::VerificationUnsupported,
            Err(ref e) if e.is_retryable() => FailureReason::VerificationExhausted,
            Err(ref e) => FailureReason::Protocol(e.to_string()),
        };
        if let Err(e) = &result {
            self.note_error(e.to_string()).await;
        }
        Err(reason)
    }
}
