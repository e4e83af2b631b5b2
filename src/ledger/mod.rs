//! Replay protection and the message audit trail.
//!
//! The ledger is the only shared mutable state of the relay. Nonce
//! reservations are serialized per `(sender, source_chain)` lane; lanes of
//! unrelated senders never wait on each other. Each lane also hands out
//! source submission turns in nonce order.

mod entry;

pub use entry::{LedgerEntry, RetryCounters, RetryStage, StatusTransition};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frostmessage::{FrostMessage, MessageStatus, ReplayKey, TxId};
use crate::utils::unix_timestamp;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Nonce {nonce} for {key} is not above the last reserved nonce {last}")]
    NonceReplay { key: ReplayKey, nonce: u64, last: u64 },

    #[error("Message {0} is already reserved")]
    DuplicateId(Uuid),

    #[error("Message {0} is not in the ledger")]
    NotFound(Uuid),

    #[error("Message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    },
}

struct Slot {
    entry: LedgerEntry,
    notify: watch::Sender<MessageStatus>,
}

/// Nonce bookkeeping of one replay key.
struct Lane {
    /// Highest reserved nonce
    last: Mutex<Option<u64>>,
    /// Reserved nonces whose source submission is still outstanding
    unsubmitted: watch::Sender<BTreeSet<u64>>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            last: Mutex::new(None),
            unsubmitted: watch::channel(BTreeSet::new()).0,
        }
    }
}

#[derive(Default)]
pub struct Ledger {
    entries: RwLock<HashMap<Uuid, Slot>>,
    lanes: RwLock<HashMap<ReplayKey, Arc<Lane>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lane(&self, key: &ReplayKey) -> Arc<Lane> {
        if let Some(lane) = self.lanes.read().await.get(key) {
            return lane.clone();
        }
        self.lanes.write().await.entry(key.clone()).or_default().clone()
    }

    /// Reserves the message's id and nonce.
    ///
    /// Fails with [`LedgerError::DuplicateId`] if the id was reserved
    /// before, and with [`LedgerError::NonceReplay`] unless the nonce is
    /// strictly above every nonce reserved for the same replay key.
    pub async fn reserve(&self, message: &FrostMessage) -> Result<(), LedgerError> {
        let key = message.replay_key();
        let lane = self.lane(&key).await;
        let mut last = lane.last.lock().await;

        if self.entries.read().await.contains_key(&message.id) {
            return Err(LedgerError::DuplicateId(message.id));
        }
        if let Some(last) = *last {
            if message.nonce <= last {
                warn!("Rejecting replayed nonce {} for {} (last {})", message.nonce, key, last);
                return Err(LedgerError::NonceReplay {
                    key,
                    nonce: message.nonce,
                    last,
                });
            }
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(&message.id) {
            return Err(LedgerError::DuplicateId(message.id));
        }
        let (notify, _) = watch::channel(MessageStatus::Created);
        entries.insert(
            message.id,
            Slot {
                entry: LedgerEntry::reserved(message),
                notify,
            },
        );
        *last = Some(message.nonce);
        lane.unsubmitted.send_modify(|pending| {
            pending.insert(message.nonce);
        });

        debug!(message_id = %message.id, "Reserved nonce {} for {}", message.nonce, key);
        Ok(())
    }

    /// Appends a status transition, rejecting moves the pipeline does not allow.
    pub async fn record_status(&self, id: &Uuid, status: MessageStatus) -> Result<(), LedgerError> {
        let mut entries = self.entries.write().await;
        let slot = entries.get_mut(id).ok_or(LedgerError::NotFound(*id))?;

        if !slot.entry.status.can_transition_to(&status) {
            return Err(LedgerError::InvalidTransition {
                id: *id,
                from: slot.entry.status.clone(),
                to: status,
            });
        }

        slot.entry.history.push(StatusTransition {
            status: status.clone(),
            at: unix_timestamp(),
        });
        slot.entry.status = status.clone();
        let released = status.is_terminal().then(|| (slot.entry.key.clone(), slot.entry.nonce));
        slot.notify.send_replace(status);
        drop(entries);

        if let Some((key, nonce)) = released {
            self.release_turn(&key, nonce).await;
        }
        Ok(())
    }

    /// Waits until every lower nonce of `key` has been accepted by the
    /// source chain or has reached a terminal status.
    pub async fn wait_for_turn(&self, key: &ReplayKey, nonce: u64) {
        let Some(lane) = self.lanes.read().await.get(key).cloned() else {
            return;
        };
        let mut turns = lane.unsubmitted.subscribe();
        let waiting = turns.borrow().first().is_some_and(|first| *first < nonce);
        if waiting {
            debug!("Nonce {} for {} waits for earlier submissions", nonce, key);
            let ready = |pending: &BTreeSet<u64>| pending.first().map_or(true, |first| *first >= nonce);
            if turns.wait_for(ready).await.is_err() {
                warn!("Submission turns for {} closed", key);
            }
        }
    }

    async fn release_turn(&self, key: &ReplayKey, nonce: u64) {
        if let Some(lane) = self.lanes.read().await.get(key) {
            lane.unsubmitted.send_if_modified(|pending| pending.remove(&nonce));
        }
    }

    async fn update<F>(&self, id: &Uuid, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut LedgerEntry),
    {
        let mut entries = self.entries.write().await;
        let slot = entries.get_mut(id).ok_or(LedgerError::NotFound(*id))?;
        f(&mut slot.entry);
        Ok(())
    }

    /// Records the accepted source transaction and passes the submission
    /// turn to the next nonce of the lane.
    pub async fn record_source_tx(&self, id: &Uuid, tx: TxId) -> Result<(), LedgerError> {
        let mut turn = None;
        self.update(id, |entry| {
            entry.source_tx = Some(tx);
            turn = Some((entry.key.clone(), entry.nonce));
        })
        .await?;
        if let Some((key, nonce)) = turn {
            self.release_turn(&key, nonce).await;
        }
        Ok(())
    }

    pub async fn record_destination_tx(&self, id: &Uuid, tx: TxId) -> Result<(), LedgerError> {
        self.update(id, |entry| entry.destination_tx = Some(tx)).await
    }

    pub async fn record_retry(&self, id: &Uuid, stage: RetryStage) -> Result<(), LedgerError> {
        self.update(id, |entry| entry.retries.increment(stage)).await
    }

    pub async fn record_error(&self, id: &Uuid, error: impl Into<String>) -> Result<(), LedgerError> {
        let error = error.into();
        self.update(id, |entry| entry.last_error = Some(error)).await
    }

    pub async fn lookup(&self, id: &Uuid) -> Result<LedgerEntry, LedgerError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|slot| slot.entry.clone())
            .ok_or(LedgerError::NotFound(*id))
    }

    /// Receiver that observes every status the message moves through.
    pub async fn subscribe(&self, id: &Uuid) -> Result<watch::Receiver<MessageStatus>, LedgerError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|slot| slot.notify.subscribe())
            .ok_or(LedgerError::NotFound(*id))
    }

    pub async fn last_nonce(&self, key: &ReplayKey) -> Option<u64> {
        let lane = self.lanes.read().await.get(key).cloned()?;
        let last = *lane.last.lock().await;
        last
    }

    /// Snapshot of every entry, ordered by replay key then nonce.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .read()
            .await
            .values()
            .map(|slot| slot.entry.clone())
            .collect();
        entries.sort_by(|a, b| (&a.key, a.nonce).cmp(&(&b.key, b.nonce)));
        entries
    }

    /// Ids of messages that have not reached a terminal status.
    pub async fn pending(&self) -> Vec<Uuid> {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| !slot.entry.is_terminal())
            .map(|slot| slot.entry.id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
