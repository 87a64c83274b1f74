//! Chain head broadcast.
//!
//! Delivery is best effort: a subscriber that falls behind or loses its
//! channel re-reads the head from storage instead of replaying events.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use super::block::BlockchainState;
use super::storage::{BlockchainStorage, StorageError};

/// Errors that can occur while publishing or consuming chain heads
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Failed to encode chain state: {0}")]
    Encoding(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Name of the channel carrying heads of `chain_id`
pub fn chain_state_channel(chain_id: u16) -> String {
    format!("blockchain-state:{}", chain_id)
}

/// Byte-oriented publish/subscribe transport
pub trait PubSub: Send + Sync {
    /// Publishes `payload`, returning how many subscribers received it
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, PubSubError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;
}

/// In-process transport backed by one broadcast channel per name
pub struct LocalPubSub {
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        LocalPubSub {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl PubSub for LocalPubSub {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, PubSubError> {
        // No listeners is not a failure
        Ok(self.sender(channel).send(payload).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(channel).subscribe()
    }
}

/// Broadcasts new chain heads as JSON
#[derive(Clone)]
pub struct ChainStatePublisher {
    pubsub: Arc<dyn PubSub>,
    channel: String,
}

impl ChainStatePublisher {
    pub fn new(pubsub: Arc<dyn PubSub>, chain_id: u16) -> Self {
        ChainStatePublisher {
            pubsub,
            channel: chain_state_channel(chain_id),
        }
    }

    pub fn publish(&self, state: &BlockchainState) -> Result<usize, PubSubError> {
        let payload = serde_json::to_vec(state).map_err(|e| PubSubError::Encoding(e.to_string()))?;
        let delivered = self.pubsub.publish(&self.channel, payload)?;
        debug!(
            "Published head {} ({}) to {} subscribers",
            state.latest_block_number, state.latest_hash, delivered
        );
        Ok(delivered)
    }
}

/// Receives chain heads, falling back to storage when events are lost
pub struct ChainStateSubscriber {
    pubsub: Arc<dyn PubSub>,
    storage: Arc<BlockchainStorage>,
    chain_id: u16,
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl ChainStateSubscriber {
    pub fn new(pubsub: Arc<dyn PubSub>, storage: Arc<BlockchainStorage>, chain_id: u16) -> Self {
        let receiver = pubsub.subscribe(&chain_state_channel(chain_id));
        ChainStateSubscriber {
            pubsub,
            storage,
            chain_id,
            receiver,
        }
    }

    /// The next head, or `None` once the transport has gone away for good
    pub async fn next(&mut self) -> Result<Option<BlockchainState>, PubSubError> {
        let mut resubscribed = false;

        loop {
            match self.receiver.recv().await {
                Ok(payload) => match serde_json::from_slice::<BlockchainState>(&payload) {
                    Ok(state) => return Ok(Some(state)),
                    Err(e) => {
                        warn!("Undecodable chain state on chain {}: {}", self.chain_id, e);
                        if let Some(state) = self.storage.get_chain_state(self.chain_id)? {
                            return Ok(Some(state));
                        }
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Chain state subscriber on chain {} skipped {} heads, re-reading from storage",
                        self.chain_id, skipped
                    );
                    if let Some(state) = self.storage.get_chain_state(self.chain_id)? {
                        return Ok(Some(state));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if resubscribed {
                        return Ok(None);
                    }
                    debug!("Chain state channel for chain {} closed, resubscribing", self.chain_id);
                    self.receiver = self.pubsub.subscribe(&chain_state_channel(self.chain_id));
                    resubscribed = true;
                    if let Some(state) = self.storage.get_chain_state(self.chain_id)? {
                        return Ok(Some(state));
                    }
                }
            }
        }
    }
}
