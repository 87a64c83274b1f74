use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::account::{Account, Token};
use super::bignum::BigNum;
use super::block::{meets_difficulty, Block, BlockData, BlockError, BlockchainState};
use super::consensus::{ConsensusError, ConsensusSettings, PoaConsensus, Stage};
use super::crypto::{Address, Hash, Wallet};
use super::genesis::{GenesisBootstrapper, GenesisError};
use super::lock::{BlockProductionLock, LocalLockRegistry};
use super::mempool::{Mempool, MempoolError, MempoolWatcher, ReconnectPolicy};
use super::pubsub::{ChainStatePublisher, ChainStateSubscriber, LocalPubSub, PubSub};
use super::state_hash::{StateHashError, StateHasher};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{MempoolTransaction, SignedTransaction};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),

    #[error("Genesis error: {0}")]
    GenesisError(#[from] GenesisError),

    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("State hash error: {0}")]
    StateHashError(#[from] StateHashError),

    #[error("Chain {0} already has a genesis block")]
    AlreadyBootstrapped(u16),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),
}

/// A producer queued behind others gives up after this many seal timeouts
const LOCK_WAIT_SEALS: u32 = 4;

/// Everything needed to run one chain besides its storage and key
#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub chain_id: u16,
    pub validator_id: String,
    pub consensus: ConsensusSettings,
    pub feed: ReconnectPolicy,
    pub pubsub_capacity: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        ChainOptions {
            chain_id: 1,
            validator_id: "authority".to_string(),
            consensus: ConsensusSettings::default(),
            feed: ReconnectPolicy::default(),
            pubsub_capacity: 64,
        }
    }
}

/// A single-authority chain: storage, block production and head broadcast
#[derive(Clone)]
pub struct Blockchain {
    chain_id: u16,

    storage: Arc<BlockchainStorage>,

    pubsub: Arc<dyn PubSub>,

    consensus: Arc<PoaConsensus>,

    mempool: Mempool,

    genesis: Arc<GenesisBootstrapper>,

    feed: ReconnectPolicy,
}

impl Blockchain {
    /// Opens the chain stored at `storage_path`, creating block #0 when the
    /// chain has none yet
    pub async fn with_storage<P: AsRef<std::path::Path>>(
        storage_path: P,
        authority: Wallet,
        options: ChainOptions,
    ) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        Self::open(Arc::new(storage), authority, options).await
    }

    /// Same as `with_storage` over a throwaway in-memory database
    #[cfg(test)]
    pub async fn temporary(authority: Wallet, options: ChainOptions) -> Result<Self, BlockchainError> {
        Self::open(Arc::new(BlockchainStorage::temporary()?), authority, options).await
    }

    async fn open(
        storage: Arc<BlockchainStorage>,
        authority: Wallet,
        options: ChainOptions,
    ) -> Result<Self, BlockchainError> {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new(options.pubsub_capacity));
        let lock: Arc<dyn BlockProductionLock> = Arc::new(LocalLockRegistry::with_timeout(
            options.consensus.seal_timeout.saturating_mul(LOCK_WAIT_SEALS),
        ));

        let genesis = GenesisBootstrapper::new(
            options.chain_id,
            storage.clone(),
            &authority,
            options.validator_id.clone(),
            options.consensus.clone(),
        );
        let consensus = PoaConsensus::new(
            options.chain_id,
            storage.clone(),
            authority.clone(),
            options.validator_id.clone(),
            ChainStatePublisher::new(pubsub.clone(), options.chain_id),
            lock,
            options.consensus.clone(),
        );

        let blockchain = Blockchain {
            chain_id: options.chain_id,
            mempool: Mempool::new(storage.clone(), options.chain_id),
            storage,
            pubsub,
            consensus: Arc::new(consensus),
            genesis: Arc::new(genesis),
            feed: options.feed,
        };

        match blockchain.state()? {
            Some(state) => info!(
                "Loaded chain {} at block {} ({})",
                blockchain.chain_id, state.latest_block_number, state.latest_hash
            ),
            None => {
                info!("No genesis block for chain {}, bootstrapping", blockchain.chain_id);
                blockchain.bootstrap().await?;
            }
        }

        Ok(blockchain)
    }

    /// Creates block #0; refused once the chain has a head
    pub async fn bootstrap(&self) -> Result<BlockchainState, BlockchainError> {
        if self.storage.get_chain_state(self.chain_id)?.is_some() {
            return Err(BlockchainError::AlreadyBootstrapped(self.chain_id));
        }
        let state = self.genesis.bootstrap().await?;
        if let Err(e) = ChainStatePublisher::new(self.pubsub.clone(), self.chain_id).publish(&state) {
            warn!("Failed to publish genesis head: {}", e);
        }
        Ok(state)
    }

    /// Forces buffered writes to disk
    pub fn flush(&self) -> Result<(), BlockchainError> {
        Ok(self.storage.flush()?)
    }

    pub fn chain_id(&self) -> u16 {
        self.consensus.chain_id()
    }

    /// Address every block must be signed by
    pub fn authority_address(&self) -> Address {
        self.consensus.authority_address()
    }

    /// Turns a signed transaction straight into a block
    pub async fn submit_transaction(&self, signed: SignedTransaction) -> Result<BlockchainState, ConsensusError> {
        self.consensus.submit(signed).await
    }

    /// Queues a signed transaction for the mempool worker
    pub fn enqueue_transaction(&self, signed: SignedTransaction) -> Result<MempoolTransaction, MempoolError> {
        self.mempool.create(signed)
    }

    pub fn state(&self) -> Result<Option<BlockchainState>, BlockchainError> {
        Ok(self.storage.get_chain_state(self.chain_id)?)
    }

    pub fn get_block(&self, number: u64) -> Result<Option<BlockData>, BlockchainError> {
        Ok(self.storage.get_block_by_number(self.chain_id, number)?)
    }

    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, BlockchainError> {
        Ok(self.storage.get_account(self.chain_id, address)?)
    }

    pub fn get_token(&self, id: &BigNum) -> Result<Option<Token>, BlockchainError> {
        Ok(self.storage.get_token(self.chain_id, id)?)
    }

    pub fn pending_transactions(&self) -> Result<Vec<MempoolTransaction>, BlockchainError> {
        Ok(self.storage.list_mempool(self.chain_id)?)
    }

    pub fn consensus_stage(&self) -> Stage {
        self.consensus.stage()
    }

    /// Live chain heads, falling back to storage when events are missed
    pub fn subscribe_state(&self) -> ChainStateSubscriber {
        ChainStateSubscriber::new(self.pubsub.clone(), self.storage.clone(), self.chain_id)
    }

    /// Feeds mempool entries into block production until `shutdown` fires.
    ///
    /// The task ends with an error once the insertion feed cannot be
    /// reopened within the configured retries.
    pub fn spawn_mempool_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), MempoolError>> {
        let watcher = MempoolWatcher::new(self.mempool.clone(), self.feed.clone());
        let consensus = self.consensus.clone();
        let chain_id = self.chain_id;

        tokio::spawn(async move {
            info!("Mempool worker started for chain {}", chain_id);
            let result = watcher
                .run(shutdown, |entry| {
                    let consensus = consensus.clone();
                    async move {
                        let id = entry.id.clone();
                        match consensus.process_mempool(entry).await {
                            Ok(Some(state)) => {
                                info!("Mempool entry {} landed in block {}", id, state.latest_block_number)
                            }
                            Ok(None) => {}
                            Err(e) if e.requires_resync() => {
                                error!("Chain {} needs resync after entry {}: {}", chain_id, id, e)
                            }
                            Err(e) => warn!("Mempool entry {} not processed: {}", id, e),
                        }
                    }
                })
                .await;
            if let Err(e) = &result {
                error!("Mempool worker for chain {} stopped: {}", chain_id, e);
            }
            result
        })
    }

    /// Re-validates every stored block from genesis to head.
    ///
    /// Historic blocks are checked against the state root in their own
    /// header; the head is checked against the root recomputed from the
    /// live ledger. Returns the number of blocks checked.
    pub fn verify_chain(&self) -> Result<usize, BlockchainError> {
        let blocks = self.storage.list_blocks(self.chain_id)?;
        let head = self
            .state()?
            .ok_or_else(|| BlockchainError::InvalidChain(format!("chain {} has no head", self.chain_id)))?;

        let genesis = match blocks.first() {
            Some(data) => data.to_block()?,
            None => return Err(BlockchainError::InvalidChain("no blocks stored".to_string())),
        };
        if !genesis.header.is_genesis() || genesis.header.prev_block_hash != Hash::ZERO {
            return Err(BlockchainError::InvalidChain("first block is not a genesis block".to_string()));
        }
        let sealed = genesis.header.content_hash()?;
        if !meets_difficulty(&sealed, genesis.header.difficulty) {
            return Err(BlockError::NotSealed {
                hash: sealed,
                difficulty: genesis.header.difficulty,
            }
            .into());
        }
        self.check_validator(&genesis)?;

        let live_root = StateHasher::new(self.storage.as_ref(), self.chain_id).account_hash_state()?;

        let mut previous = genesis;
        for (index, data) in blocks.iter().enumerate().skip(1) {
            let block = data.to_block()?;
            let expected_root = if index + 1 == blocks.len() {
                live_root
            } else {
                block.header.state_root
            };
            block.validate_block(&previous, &expected_root)?;
            self.check_validator(&block)?;
            previous = block;
        }

        if previous.hash()? != head.latest_hash || previous.number() != head.latest_block_number {
            return Err(BlockchainError::InvalidChain(format!(
                "head points at {} ({}) but the last stored block is {}",
                head.latest_block_number,
                head.latest_hash,
                previous.number()
            )));
        }
        if blocks.len() == 1 && live_root != previous.header.state_root {
            return Err(BlockError::StateRootMismatch {
                expected: live_root,
                got: previous.header.state_root,
            }
            .into());
        }

        Ok(blocks.len())
    }

    fn check_validator(&self, block: &Block) -> Result<(), BlockchainError> {
        block.verify_signature()?;
        let signer = block.validator.address().map_err(BlockError::from)?;
        if signer != self.authority_address() {
            return Err(BlockError::SignatureMismatch(block.validator.id.clone()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;
    use std::time::Duration;

    fn options() -> ChainOptions {
        ChainOptions {
            chain_id: 21,
            validator_id: "authority".to_string(),
            consensus: ConsensusSettings {
                difficulty: 1,
                transaction_fee: 1,
                seal_timeout: Duration::from_secs(20),
            },
            feed: ReconnectPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 100,
                max_retries: 3,
            },
            pubsub_capacity: 16,
        }
    }

    async fn transfer(chain: &Blockchain, wallet: &Wallet, to: Address, value: u64) -> BlockchainState {
        let nonce = chain.get_account(&wallet.address()).unwrap().unwrap().nonce;
        let signed = Transaction::coin(chain.chain_id(), nonce, wallet.address(), to, value)
            .sign(wallet)
            .unwrap();
        chain.submit_transaction(signed).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_bootstraps_once() {
        let authority = Wallet::new();
        let chain = Blockchain::temporary(authority.clone(), options()).await.unwrap();

        let state = chain.state().unwrap().unwrap();
        assert_eq!(state.latest_block_number, 0);
        assert_eq!(
            chain.get_account(&authority.address()).unwrap().unwrap().balance,
            u64::MAX
        );
        assert!(matches!(
            chain.bootstrap().await,
            Err(BlockchainError::AlreadyBootstrapped(21))
        ));
    }

    #[tokio::test]
    async fn test_reopen_keeps_head() {
        let dir = std::env::temp_dir().join(format!("poa-ledger-{}", uuid::Uuid::new_v4()));
        let authority = Wallet::new();
        let head = {
            let chain = Blockchain::with_storage(&dir, authority.clone(), options()).await.unwrap();
            let head = transfer(&chain, &authority, Wallet::new().address(), 9).await;
            chain.flush().unwrap();
            head
        };

        let reopened = Blockchain::with_storage(&dir, authority, options()).await.unwrap();
        assert_eq!(reopened.state().unwrap().unwrap(), head);
        assert_eq!(reopened.verify_chain().unwrap(), 2);
        drop(reopened);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_verify_chain_accepts_produced_blocks() {
        let authority = Wallet::new();
        let chain = Blockchain::temporary(authority.clone(), options()).await.unwrap();
        assert_eq!(chain.verify_chain().unwrap(), 1);

        for value in [5, 6, 7] {
            transfer(&chain, &authority, Wallet::new().address(), value).await;
        }
        assert_eq!(chain.verify_chain().unwrap(), 4);
        assert_eq!(chain.state().unwrap().unwrap().latest_block_number, 6);
    }

    #[tokio::test]
    async fn test_verify_chain_detects_ledger_tampering() {
        let authority = Wallet::new();
        let chain = Blockchain::temporary(authority.clone(), options()).await.unwrap();
        let alice = Wallet::new();
        transfer(&chain, &authority, alice.address(), 50).await;

        let mut account = chain.get_account(&alice.address()).unwrap().unwrap();
        account.balance += 1_000;
        chain.storage.upsert_account(&account).unwrap();

        assert!(matches!(
            chain.verify_chain(),
            Err(BlockchainError::InvalidBlock(BlockError::StateRootMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_mempool_worker_produces_blocks() {
        let authority = Wallet::new();
        let chain = Blockchain::temporary(authority.clone(), options()).await.unwrap();
        let mut heads = chain.subscribe_state();
        let (stop, shutdown) = watch::channel(false);
        let worker = chain.spawn_mempool_worker(shutdown);

        let nonce = chain.get_account(&authority.address()).unwrap().unwrap().nonce;
        let recipient = Wallet::new().address();
        let signed = Transaction::coin(chain.chain_id(), nonce, authority.address(), recipient, 12)
            .sign(&authority)
            .unwrap();
        let entry = chain.enqueue_transaction(signed).unwrap();

        let head = tokio::time::timeout(Duration::from_secs(20), heads.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(head.latest_block_number, 2);
        assert_eq!(chain.get_account(&recipient).unwrap().unwrap().balance, 12);

        // The entry is removed right after its block is published
        let mut consumed = false;
        for _ in 0..50 {
            if chain.pending_transactions().unwrap().iter().all(|p| p.id != entry.id) {
                consumed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(consumed);

        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
