//! Proof-of-Authority block production.
//!
//! Every accepted transaction becomes one block:
//!
//! 1. VALIDATE  - payload, signature and a dry run against current state
//! 2. MUTATE    - apply to a staged ledger under the production lock
//! 3. SEAL      - search a header nonce meeting the difficulty, with a deadline
//! 4. SIGN      - authority signature over the sealed header
//! 5. PERSIST   - ledger rows, block and head in one storage transaction
//! 6. PUBLISH   - broadcast the new head
//!
//! Nothing is written unless every step before PERSIST succeeded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::account::{LedgerError, Token};
use super::bignum::BigNum;
use super::block::{Block, BlockData, BlockError, BlockHeader, BlockchainState, Validator, BLOCK_STRIDE};
use super::crypto::{Address, Hash, Wallet};
use super::lock::{block_production_lock_name, BlockProductionLock, LockError};
use super::mempool::{Mempool, MempoolError};
use super::merkle::MerkleTree;
use super::pubsub::ChainStatePublisher;
use super::state_hash::{StateHashError, StateHasher};
use super::storage::{BlockchainStorage, LedgerTxn, StorageError};
use super::transaction::{MempoolTransaction, SignedTransaction, Transaction, TransactionError, TransactionKind};

/// Errors produced while turning a transaction into a block
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Invalid transaction: {0}")]
    Validation(#[from] TransactionError),

    #[error("Transaction not permitted: {0}")]
    Authorization(#[from] LedgerError),

    #[error("Block rejected: {0}")]
    Consistency(#[from] BlockError),

    #[error("Could not seal block within {0:?}")]
    SealTimeout(Duration),

    #[error("Failed to sign block: {0}")]
    Signing(String),

    #[error("Chain {0} has no genesis block")]
    NotBootstrapped(u16),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),
}

impl ConsensusError {
    /// Worth re-running with the same transaction
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsensusError::SealTimeout(_) | ConsensusError::Infrastructure(_))
    }

    /// The chain diverged; linear extension will keep failing
    pub fn requires_resync(&self) -> bool {
        matches!(self, ConsensusError::Consistency(e) if e.requires_resync())
    }

    /// The transaction itself is at fault and must not be retried
    pub fn consumes_transaction(&self) -> bool {
        matches!(self, ConsensusError::Validation(_) | ConsensusError::Authorization(_))
    }

    /// Field-level messages for caller-facing errors
    pub fn field_errors(&self) -> Option<BTreeMap<String, String>> {
        let (field, message) = match self {
            ConsensusError::Validation(e) => (e.field(), e.to_string()),
            ConsensusError::Authorization(e) => (e.field(), e.to_string()),
            _ => return None,
        };
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), message);
        Some(errors)
    }
}

impl From<StorageError> for ConsensusError {
    fn from(e: StorageError) -> Self {
        ConsensusError::Infrastructure(e.to_string())
    }
}

impl From<StateHashError> for ConsensusError {
    fn from(e: StateHashError) -> Self {
        ConsensusError::Infrastructure(e.to_string())
    }
}

impl From<LockError> for ConsensusError {
    fn from(e: LockError) -> Self {
        ConsensusError::Infrastructure(e.to_string())
    }
}

impl From<MempoolError> for ConsensusError {
    fn from(e: MempoolError) -> Self {
        match e {
            MempoolError::Validation(e) => ConsensusError::Validation(e),
            other => ConsensusError::Infrastructure(other.to_string()),
        }
    }
}

/// Where the mechanism currently is in producing a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    Validating = 1,
    Mutating = 2,
    Sealing = 3,
    Signing = 4,
    Persisting = 5,
    Publishing = 6,
}

impl Stage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Stage::Validating,
            2 => Stage::Mutating,
            3 => Stage::Sealing,
            4 => Stage::Signing,
            5 => Stage::Persisting,
            6 => Stage::Publishing,
            _ => Stage::Idle,
        }
    }
}

/// Tunables for block production
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    pub difficulty: u16,
    pub transaction_fee: u64,
    pub seal_timeout: Duration,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        ConsensusSettings {
            difficulty: 2,
            transaction_fee: 1,
            seal_timeout: Duration::from_secs(30),
        }
    }
}

/// Header fields fixed before assembly
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub chain_id: u16,
    pub number: u64,
    pub prev_block_hash: Hash,
    pub timestamp: u64,
    pub difficulty: u16,
    pub beneficiary: Address,
    pub transaction_fee: u64,
    pub state_root: Hash,
    pub tokens_root: Hash,
    pub latest_token_id: BigNum,
}

/// Turns applied transactions into an unsealed header and its tree
pub trait BlockAssembler: Send + Sync {
    fn assemble(
        &self,
        context: BlockContext,
        transactions: Vec<SignedTransaction>,
    ) -> Result<(BlockHeader, MerkleTree<SignedTransaction>), BlockError>;
}

/// Keeps transactions in the order they were applied
#[derive(Debug, Default)]
pub struct OrderedAssembler;

impl BlockAssembler for OrderedAssembler {
    fn assemble(
        &self,
        context: BlockContext,
        transactions: Vec<SignedTransaction>,
    ) -> Result<(BlockHeader, MerkleTree<SignedTransaction>), BlockError> {
        let tree = MerkleTree::new(transactions)?;
        let header = BlockHeader {
            chain_id: context.chain_id,
            number: context.number,
            prev_block_hash: context.prev_block_hash,
            timestamp: context.timestamp,
            difficulty: context.difficulty,
            beneficiary: context.beneficiary,
            transaction_fee: context.transaction_fee,
            state_root: context.state_root,
            trans_root: tree.root(),
            nonce: 0,
            latest_token_id: context.latest_token_id,
            tokens_root: context.tokens_root,
        };
        Ok((header, tree))
    }
}

pub(crate) fn current_timestamp() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Applies one transaction to the staged ledger.
///
/// Returns the latest minted token id afterwards. `latest_token_id` is the
/// id recorded in the current head; on a chain without tokens the first
/// mint must use it as is, otherwise the next mint must use it plus one.
pub(crate) fn apply_transaction(
    txn: &mut LedgerTxn<'_>,
    tx: &Transaction,
    beneficiary: &Address,
    latest_token_id: &BigNum,
) -> Result<BigNum, ConsensusError> {
    let mut sender = txn.account_or_default(&tx.from)?;
    if !sender.is_valid_nonce(&tx.nonce) {
        return Err(LedgerError::InvalidNonce {
            address: tx.from,
            expected: sender.nonce.clone(),
            got: tx.nonce.clone(),
        }
        .into());
    }

    let mut latest = latest_token_id.clone();

    match &tx.kind {
        TransactionKind::Coin => {
            sender.withdraw(tx.value)?;
            sender.increment_nonce();
            txn.put_account(sender);

            let mut recipient = txn.account_or_default(&tx.to)?;
            recipient.deposit(tx.value)?;
            txn.put_account(recipient);
        }
        TransactionKind::Token {
            token_id,
            metadata_uri,
            token_nonce,
        } => {
            let token = match txn.token(token_id)? {
                Some(mut token) => {
                    token.authorize(&tx.from, token_nonce)?;
                    if tx.to.is_zero() {
                        token.burn();
                    } else {
                        token.transfer(tx.to);
                    }
                    token
                }
                None => {
                    let expected = if txn.token(latest_token_id)?.is_some() {
                        latest_token_id.increment()
                    } else {
                        latest_token_id.clone()
                    };
                    if *token_id != expected {
                        return Err(LedgerError::UnexpectedMintId {
                            expected,
                            got: token_id.clone(),
                        }
                        .into());
                    }
                    if !token_nonce.is_zero() {
                        return Err(LedgerError::TokenNonceMismatch {
                            token_id: token_id.clone(),
                            expected: BigNum::zero(),
                            got: token_nonce.clone(),
                        }
                        .into());
                    }
                    if tx.to.is_zero() {
                        return Err(TransactionError::InvalidRecipientAddress(
                            "tokens cannot be minted to the zero address".to_string(),
                        )
                        .into());
                    }
                    latest = token_id.clone();
                    Token::mint(tx.chain_id, token_id.clone(), tx.to, metadata_uri.clone())
                }
            };

            if tx.value > 0 {
                sender.withdraw(tx.value)?;
            }
            sender.increment_nonce();
            txn.put_account(sender);

            if tx.value > 0 {
                let mut collector = txn.account_or_default(beneficiary)?;
                collector.deposit(tx.value)?;
                txn.put_account(collector);
            }

            txn.put_token(token)?;
        }
    }

    Ok(latest)
}

/// Stops a running seal search once its caller is gone
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Seals `header` on the blocking pool, giving up after `limit`.
///
/// Dropping the returned future also stops the search, so an abandoned
/// submission never keeps a blocking thread busy.
pub(crate) async fn seal_with_timeout(mut header: BlockHeader, limit: Duration) -> Result<BlockHeader, ConsensusError> {
    let cancel = CancelOnDrop(Arc::new(AtomicBool::new(false)));
    let flag = cancel.0.clone();

    let task = tokio::task::spawn_blocking(move || {
        header.seal(&flag)?;
        Ok::<BlockHeader, BlockError>(header)
    });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(Ok(sealed))) => Ok(sealed),
        Ok(Ok(Err(BlockError::SealCancelled))) => Err(ConsensusError::SealTimeout(limit)),
        Ok(Ok(Err(e))) => Err(e.into()),
        Ok(Err(join)) => Err(ConsensusError::Infrastructure(format!("seal task failed: {}", join))),
        Err(_) => Err(ConsensusError::SealTimeout(limit)),
    }
}

/// Puts the producer back to `Idle` when a block attempt ends, however
/// it ends. Must be created while the production lock is held.
struct StageReset<'a>(&'a PoaConsensus);

impl Drop for StageReset<'_> {
    fn drop(&mut self) {
        self.0.enter(Stage::Idle);
    }
}

/// The single-authority block producer for one chain
pub struct PoaConsensus {
    chain_id: u16,
    storage: Arc<BlockchainStorage>,
    authority: Wallet,
    validator: Validator,
    mempool: Mempool,
    publisher: ChainStatePublisher,
    lock: Arc<dyn BlockProductionLock>,
    assembler: Box<dyn BlockAssembler>,
    settings: ConsensusSettings,
    stage: AtomicU8,
}

impl PoaConsensus {
    pub fn new(
        chain_id: u16,
        storage: Arc<BlockchainStorage>,
        authority: Wallet,
        validator_id: impl Into<String>,
        publisher: ChainStatePublisher,
        lock: Arc<dyn BlockProductionLock>,
        settings: ConsensusSettings,
    ) -> Self {
        let validator = Validator::from_wallet(validator_id, &authority);
        PoaConsensus {
            chain_id,
            mempool: Mempool::new(storage.clone(), chain_id),
            storage,
            authority,
            validator,
            publisher,
            lock,
            assembler: Box::new(OrderedAssembler),
            settings,
            stage: AtomicU8::new(Stage::Idle as u8),
        }
    }

    /// Replaces how blocks are put together
    pub fn with_assembler(mut self, assembler: Box<dyn BlockAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    pub fn authority_address(&self) -> Address {
        self.authority.address()
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    fn enter(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
        debug!("Chain {} consensus stage: {:?}", self.chain_id, stage);
    }

    /// Produces a block for a transaction handed in directly
    pub async fn submit(&self, signed: SignedTransaction) -> Result<BlockchainState, ConsensusError> {
        let result = self.produce(signed).await;

        if let Err(e) = &result {
            if e.consumes_transaction() {
                warn!("Rejected transaction on chain {}: {}", self.chain_id, e);
            } else if e.is_retryable() {
                warn!("Block production on chain {} failed, retryable: {}", self.chain_id, e);
            } else {
                error!("Block production on chain {} failed: {}", self.chain_id, e);
            }
        }
        result
    }

    /// Produces a block for a pending mempool entry.
    ///
    /// The entry is deleted once its block lands or when the transaction
    /// itself is rejected; seal timeouts and infrastructure failures leave
    /// it pending. Returns `None` if another consumer already took it.
    pub async fn process_mempool(&self, entry: MempoolTransaction) -> Result<Option<BlockchainState>, ConsensusError> {
        if self.mempool.get(&entry.id)?.is_none() {
            debug!("Mempool entry {} already consumed", entry.id);
            return Ok(None);
        }

        match self.submit(entry.signed).await {
            Ok(state) => {
                self.mempool.delete_by_id(&entry.id)?;
                Ok(Some(state))
            }
            Err(e) => {
                if e.consumes_transaction() {
                    self.mempool.delete_by_id(&entry.id)?;
                }
                Err(e)
            }
        }
    }

    fn head(&self) -> Result<(BlockchainState, Block), ConsensusError> {
        let state = self
            .storage
            .get_chain_state(self.chain_id)?
            .ok_or(ConsensusError::NotBootstrapped(self.chain_id))?;
        let block = self
            .storage
            .get_block_by_hash(self.chain_id, &state.latest_hash)?
            .ok_or_else(|| {
                ConsensusError::Infrastructure(format!("head block {} is missing", state.latest_hash))
            })?
            .to_block()?;
        Ok((state, block))
    }

    async fn produce(&self, signed: SignedTransaction) -> Result<BlockchainState, ConsensusError> {
        signed.validate(self.chain_id, true)?;
        let beneficiary = self.authority.address();

        // Fail fast without contending for the lock
        {
            let (state, _) = self.head()?;
            let mut dry_run = self.storage.begin(self.chain_id);
            apply_transaction(&mut dry_run, &signed.transaction, &beneficiary, &state.latest_token_id)?;
            dry_run.discard();
        }

        // Stage changes only happen under the lock; the reset drops first
        let _guard = self.lock.acquire(&block_production_lock_name(self.chain_id)).await?;
        let _stage = StageReset(self);

        self.enter(Stage::Validating);
        let (state, previous) = self.head()?;

        self.enter(Stage::Mutating);
        let mut txn = self.storage.begin(self.chain_id);
        let latest_token_id =
            apply_transaction(&mut txn, &signed.transaction, &beneficiary, &state.latest_token_id)?;

        let hasher = StateHasher::new(&txn, self.chain_id);
        let state_root = hasher.account_hash_state()?;
        let tokens_root = hasher.token_hash_state()?;

        let context = BlockContext {
            chain_id: self.chain_id,
            number: previous.number() + BLOCK_STRIDE,
            prev_block_hash: state.latest_hash,
            timestamp: current_timestamp().max(previous.header.timestamp),
            difficulty: self.settings.difficulty.max(previous.header.difficulty),
            beneficiary,
            transaction_fee: self.settings.transaction_fee,
            state_root,
            tokens_root,
            latest_token_id,
        };
        let (header, tree) = self.assembler.assemble(context, vec![signed])?;

        self.enter(Stage::Sealing);
        let header = seal_with_timeout(header, self.settings.seal_timeout).await?;

        self.enter(Stage::Signing);
        let block = Block::sign(header, tree, &self.authority, self.validator.clone())
            .map_err(|e| ConsensusError::Signing(e.to_string()))?;
        block.validate_block(&previous, &state_root)?;
        block.verify_signature()?;

        self.enter(Stage::Persisting);
        let data = BlockData::new(&block)?;
        let next = BlockchainState::from_block(&block)?;
        self.storage
            .commit_block(txn, &data, &next, Some(state.latest_hash))?;
        info!(
            "Produced block {} ({}) on chain {}",
            next.latest_block_number, next.latest_hash, self.chain_id
        );

        self.enter(Stage::Publishing);
        if let Err(e) = self.publisher.publish(&next) {
            warn!("Failed to publish head {}: {}", next.latest_block_number, e);
        }

        Ok(next)
    }
}
