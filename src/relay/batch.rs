//! Coalescing of destination submissions.
//!
//! One batcher task runs per destination chain. Workflows hand it their
//! outbound message and wait for their own transaction id; the batcher
//! flushes once `max_batch_size` requests are queued or `max_batch_wait`
//! has passed since the first one.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::config::BatchConfig;
use super::{lease, record_outcome};
use crate::chainadapter::{accept_duplicate, AdapterError};
use crate::frostmessage::{ChainId, FrostMessage, TxId};
use crate::registry::AdapterRegistry;

pub(crate) struct BatchRequest {
    message: FrostMessage,
    reply: oneshot::Sender<Result<TxId, AdapterError>>,
}

/// Sending side of a destination batcher.
#[derive(Clone)]
pub(crate) struct BatchQueue {
    chain: ChainId,
    requests: mpsc::Sender<BatchRequest>,
}

impl BatchQueue {
    /// Queues the message and waits for the outcome of its own submission.
    pub(crate) async fn submit(&self, message: FrostMessage) -> Result<TxId, AdapterError> {
        let stopped = || AdapterError::Connectivity(format!("batcher for {} stopped", self.chain));
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(BatchRequest { message, reply })
            .await
            .map_err(|_| stopped())?;
        outcome.await.map_err(|_| stopped())?
    }
}

pub(crate) struct DestinationBatcher {
    chain: ChainId,
    registry: Arc<AdapterRegistry>,
    config: BatchConfig,
    requests: mpsc::Receiver<BatchRequest>,
    shutdown: CancellationToken,
}

impl DestinationBatcher {
    pub(crate) fn spawn(
        chain: ChainId,
        registry: Arc<AdapterRegistry>,
        config: BatchConfig,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> BatchQueue {
        let (tx, rx) = mpsc::channel(config.max_batch_size.max(1) * 4);
        let batcher = Self {
            chain,
            registry,
            config,
            requests: rx,
            shutdown,
        };
        tracker.spawn(batcher.run());
        BatchQueue { chain, requests: tx }
    }

    async fn run(mut self) {
        debug!(chain = %self.chain, "Destination batcher started");
        while let Some(batch) = self.collect().await {
            self.flush(batch).await;
        }
        debug!(chain = %self.chain, "Destination batcher stopped");
    }

    /// Next batch, or `None` once the relay shuts down.
    async fn collect(&mut self) -> Option<Vec<BatchRequest>> {
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            request = self.requests.recv() => request?,
        };

        let deadline = tokio::time::Instant::now() + self.config.max_batch_wait;
        let mut batch = vec![first];
        while batch.len() < self.config.max_batch_size {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = sleep_until(deadline) => break,
                request = self.requests.recv() => match request {
                    Some(request) => batch.push(request),
                    None => break,
                },
            }
        }
        Some(batch)
    }

    async fn flush(&self, mut batch: Vec<BatchRequest>) {
        // A closed reply means the workflow was cancelled while queued.
        batch.retain(|request| {
            let waiting = !request.reply.is_closed();
            if !waiting {
                debug!(chain = %self.chain, message_id = %request.message.id, "Dropping abandoned batch request");
            }
            waiting
        });
        if batch.is_empty() {
            return;
        }

        // Same-sender messages must reach the chain in nonce order.
        batch.sort_by(|a, b| {
            (a.message.replay_key(), a.message.nonce).cmp(&(b.message.replay_key(), b.message.nonce))
        });
        let messages: Vec<FrostMessage> = batch.iter().map(|request| request.message.clone()).collect();
        debug!(chain = %self.chain, size = messages.len(), "Flushing destination batch");

        let result = match lease(&self.registry, &self.chain).await {
            Ok(adapter) => {
                let started = Instant::now();
                let result = adapter.submit_batch(&messages).await;
                drop(adapter);
                record_outcome(&self.registry, &self.chain, &result, started).await;
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(txs) if txs.len() == batch.len() => {
                for (request, tx) in batch.into_iter().zip(txs) {
                    let _ = request.reply.send(Ok(tx));
                }
            }
            Ok(txs) => {
                warn!(
                    chain = %self.chain,
                    "Batch of {} messages returned {} transaction ids, submitting individually",
                    batch.len(),
                    txs.len()
                );
                self.submit_individually(batch).await;
            }
            Err(e) => {
                warn!(chain = %self.chain, "Batch submission failed, submitting individually: {}", e);
                self.submit_individually(batch).await;
            }
        }
    }

    /// Per-message fallback so every member gets its own outcome.
    async fn submit_individually(&self, batch: Vec<BatchRequest>) {
        for request in batch {
            if request.reply.is_closed() {
                continue;
            }
            let outcome = match lease(&self.registry, &self.chain).await {
                Ok(adapter) => {
                    let started = Instant::now();
                    let result = accept_duplicate(adapter.submit_message(&request.message).await);
                    drop(adapter);
                    record_outcome(&self.registry, &self.chain, &result, started).await;
                    result
                }
                Err(e) => Err(e),
            };
            let _ = request.reply.send(outcome);
        }
    }
}
