//! Mempool gateway: validated intake of signed transactions, deletion once
//! consumed, and a live insertion feed for nodes that watch the pool.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{MempoolTransaction, SignedTransaction, TransactionError};

/// How long the feed thread waits on sled before checking for a gone consumer
const FEED_POLL_INTERVAL: Duration = Duration::from_millis(250);

const FEED_BUFFER: usize = 256;

/// Errors that can occur in the mempool gateway
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Invalid transaction: {0}")]
    Validation(#[from] TransactionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Insertion feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("Insertion feed closed {0} times in a row, giving up")]
    FeedRetriesExhausted(u32),
}

/// Validates and stores pending transactions for one chain
#[derive(Debug, Clone)]
pub struct Mempool {
    storage: Arc<BlockchainStorage>,
    chain_id: u16,
}

impl Mempool {
    pub fn new(storage: Arc<BlockchainStorage>, chain_id: u16) -> Self {
        Mempool { storage, chain_id }
    }

    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    /// Validates `signed` (signature required) and stores it as pending
    pub fn create(&self, signed: SignedTransaction) -> Result<MempoolTransaction, MempoolError> {
        signed.validate(self.chain_id, true)?;

        let entry = MempoolTransaction::new(signed, self.storage.generate_id()?);
        self.storage.upsert_mempool(&entry)?;
        debug!("Mempool accepted {} on chain {}", entry.id, self.chain_id);
        Ok(entry)
    }

    /// Removes a consumed transaction; returns whether it was still pending
    pub fn delete_by_id(&self, id: &str) -> Result<bool, MempoolError> {
        Ok(self.storage.delete_mempool(id)?)
    }

    pub fn get(&self, id: &str) -> Result<Option<MempoolTransaction>, MempoolError> {
        Ok(self.storage.get_mempool(id)?)
    }

    /// Pending transactions in arrival order
    pub fn list(&self) -> Result<Vec<MempoolTransaction>, MempoolError> {
        Ok(self.storage.list_mempool(self.chain_id)?)
    }

    /// Opens a live feed of insertions into this chain's mempool.
    ///
    /// sled notifications are blocking, so a dedicated thread drains them
    /// into a bounded channel. The thread exits when the consumer drops the
    /// feed or the database goes away, which closes the feed.
    pub fn insertion_feed(&self) -> Result<InsertionFeed, MempoolError> {
        let mut subscriber = self.storage.watch_mempool(self.chain_id);
        let (sender, receiver) = mpsc::channel(FEED_BUFFER);
        let chain_id = self.chain_id;

        thread::Builder::new()
            .name(format!("mempool-feed-{}", chain_id))
            .spawn(move || loop {
                if sender.is_closed() {
                    break;
                }
                match subscriber.next_timeout(FEED_POLL_INTERVAL) {
                    Ok(sled::Event::Insert { key, value }) => {
                        match bincode::deserialize::<MempoolTransaction>(&value) {
                            Ok(entry) => {
                                if sender.blocking_send(entry).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Undecodable mempool insert {}: {}", hex::encode(&key), e),
                        }
                    }
                    Ok(sled::Event::Remove { .. }) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        debug!("Mempool watcher for chain {} disconnected", chain_id);
                        break;
                    }
                }
            })
            .map_err(|e| MempoolError::FeedUnavailable(e.to_string()))?;

        Ok(InsertionFeed::from_receiver(receiver))
    }
}

/// Stream of transactions as they land in the mempool
pub struct InsertionFeed {
    receiver: mpsc::Receiver<MempoolTransaction>,
}

impl InsertionFeed {
    pub(crate) fn from_receiver(receiver: mpsc::Receiver<MempoolTransaction>) -> Self {
        InsertionFeed { receiver }
    }

    /// Ends once the feed thread stops
    pub fn into_stream(self) -> impl Stream<Item = MempoolTransaction> {
        stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|entry| (entry, receiver))
        })
    }
}

/// Capped exponential backoff for reopening a closed feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // 100ms, 200ms, 400ms, 800ms, 1600ms
        ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Where a watcher gets its pending backlog and live feed from
pub trait FeedSource: Send + Sync {
    fn pending(&self) -> Result<Vec<MempoolTransaction>, MempoolError>;
    fn open(&self) -> Result<InsertionFeed, MempoolError>;
}

impl FeedSource for Mempool {
    fn pending(&self) -> Result<Vec<MempoolTransaction>, MempoolError> {
        self.list()
    }

    fn open(&self) -> Result<InsertionFeed, MempoolError> {
        self.insertion_feed()
    }
}

/// Drives a handler with everything the mempool receives, reopening the
/// feed with backoff whenever it closes.
pub struct MempoolWatcher<S: FeedSource> {
    source: S,
    policy: ReconnectPolicy,
}

impl<S: FeedSource> MempoolWatcher<S> {
    pub fn new(source: S, policy: ReconnectPolicy) -> Self {
        MempoolWatcher { source, policy }
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped).
    ///
    /// On each (re)connect the pending backlog is replayed before live
    /// insertions, so the handler may see an entry twice and must
    /// tolerate that. Returns `FeedRetriesExhausted` after
    /// `max_retries` consecutive closures without a delivered entry.
    pub async fn run<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut handle: F) -> Result<(), MempoolError>
    where
        F: FnMut(MempoolTransaction) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.source.open() {
                Ok(feed) => {
                    let mut feed = Box::pin(feed.into_stream());
                    match self.source.pending() {
                        Ok(backlog) => {
                            if !backlog.is_empty() {
                                info!("Replaying {} pending mempool transactions", backlog.len());
                            }
                            for entry in backlog {
                                handle(entry).await;
                            }
                        }
                        Err(e) => warn!("Failed to list pending mempool transactions: {}", e),
                    }

                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return Ok(());
                                }
                            }
                            entry = feed.next() => match entry {
                                Some(entry) => {
                                    failures = 0;
                                    handle(entry).await;
                                }
                                None => break,
                            },
                        }
                    }
                }
                Err(e) => warn!("Failed to open mempool feed: {}", e),
            }

            failures += 1;
            if failures > self.policy.max_retries {
                return Err(MempoolError::FeedRetriesExhausted(self.policy.max_retries));
            }

            let delay = self.policy.delay_for(failures);
            warn!(
                "Mempool feed closed, reconnecting in {:?} (attempt {}/{})",
                delay, failures, self.policy.max_retries
            );
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
