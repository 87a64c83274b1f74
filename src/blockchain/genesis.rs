use std::sync::Arc;

use log::info;
use thiserror::Error;

use super::account::Account;
use super::bignum::BigNum;
use super::block::{Block, BlockData, BlockchainState, Validator};
use super::consensus::{
    apply_transaction, current_timestamp, seal_with_timeout, BlockAssembler, BlockContext, ConsensusError,
    ConsensusSettings, OrderedAssembler,
};
use super::crypto::{Hash, Wallet};
use super::state_hash::StateHasher;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{SignedTransaction, Transaction};

/// Metadata URI of the token minted in block #0
pub const GENESIS_TOKEN_URI: &str = "poa-ledger://genesis/token/0";

/// Errors that can occur while creating block #0
#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("Failed to build genesis block: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Creates block #0 and the first chain head.
///
/// Runs the same mutate, seal, sign and persist steps as regular block
/// production, fed with two synthesized coinbase transactions instead of
/// the mempool. Refusing to run twice is up to the caller.
pub struct GenesisBootstrapper {
    chain_id: u16,
    storage: Arc<BlockchainStorage>,
    authority: Wallet,
    validator: Validator,
    settings: ConsensusSettings,
}

impl GenesisBootstrapper {
    pub fn new(
        chain_id: u16,
        storage: Arc<BlockchainStorage>,
        authority: &Wallet,
        validator_id: impl Into<String>,
        settings: ConsensusSettings,
    ) -> Self {
        GenesisBootstrapper {
            chain_id,
            storage,
            validator: Validator::from_wallet(validator_id, authority),
            authority: authority.clone(),
            settings,
        }
    }

    /// Self-to-self transfer of the whole supply, then a mint of token 0
    fn coinbase_transactions(&self) -> Result<Vec<SignedTransaction>, ConsensusError> {
        let coinbase = self.authority.address();
        let transfer = Transaction::coin(self.chain_id, 0u64, coinbase, coinbase, u64::MAX).sign(&self.authority)?;
        let mint = Transaction::token(
            self.chain_id,
            1u64,
            coinbase,
            coinbase,
            0,
            BigNum::zero(),
            GENESIS_TOKEN_URI,
            BigNum::zero(),
        )
        .sign(&self.authority)?;
        Ok(vec![transfer, mint])
    }

    pub async fn bootstrap(&self) -> Result<BlockchainState, GenesisError> {
        let coinbase = self.authority.address();
        let transactions = self.coinbase_transactions()?;

        let mut txn = self.storage.begin(self.chain_id);
        let mut account = Account::new(self.chain_id, coinbase);
        account.balance = u64::MAX;
        txn.put_account(account);

        let mut latest_token_id = BigNum::zero();
        for signed in &transactions {
            latest_token_id = apply_transaction(&mut txn, &signed.transaction, &coinbase, &latest_token_id)?;
        }

        let hasher = StateHasher::new(&txn, self.chain_id);
        let state_root = hasher.account_hash_state().map_err(ConsensusError::from)?;
        let tokens_root = hasher.token_hash_state().map_err(ConsensusError::from)?;

        let context = BlockContext {
            chain_id: self.chain_id,
            number: 0,
            prev_block_hash: Hash::ZERO,
            timestamp: current_timestamp(),
            difficulty: self.settings.difficulty,
            beneficiary: coinbase,
            transaction_fee: self.settings.transaction_fee,
            state_root,
            tokens_root,
            latest_token_id,
        };
        let (header, tree) = OrderedAssembler
            .assemble(context, transactions)
            .map_err(ConsensusError::from)?;
        let header = seal_with_timeout(header, self.settings.seal_timeout).await?;

        let block = Block::sign(header, tree, &self.authority, self.validator.clone())
            .map_err(|e| ConsensusError::Signing(e.to_string()))?;
        block.verify_signature().map_err(ConsensusError::from)?;

        let data = BlockData::new(&block).map_err(ConsensusError::from)?;
        let state = BlockchainState::from_block(&block).map_err(ConsensusError::from)?;
        self.storage.commit_block(txn, &data, &state, None)?;

        info!(
            "Created genesis block for chain {} with coinbase {}",
            self.chain_id, coinbase
        );
        Ok(state)
    }
}
