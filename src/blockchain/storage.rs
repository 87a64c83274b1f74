use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Subscriber, Transactional, Tree};
use thiserror::Error;

use super::account::{Account, LedgerError, Token};
use super::bignum::BigNum;
use super::block::{BlockData, BlockchainState};
use super::crypto::{Address, Hash};
use super::state_hash::LedgerSource;
use super::transaction::MempoolTransaction;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Refused token write: {0}")]
    StaleTokenWrite(LedgerError),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

fn abort<T>(error: StorageError) -> Result<T, ConflictableTransactionError<StorageError>> {
    Err(ConflictableTransactionError::Abort(error))
}

fn chain_key(chain_id: u16) -> Vec<u8> {
    chain_id.to_be_bytes().to_vec()
}

fn prefixed(chain_id: u16, suffix: &[u8]) -> Vec<u8> {
    let mut key = chain_key(chain_id);
    key.extend_from_slice(suffix);
    key
}

fn account_key(chain_id: u16, address: &Address) -> Vec<u8> {
    prefixed(chain_id, address.as_bytes())
}

fn token_key(chain_id: u16, id: &BigNum) -> Vec<u8> {
    prefixed(chain_id, &id.to_be_bytes())
}

fn block_key(chain_id: u16, hash: &Hash) -> Vec<u8> {
    prefixed(chain_id, hash.as_bytes())
}

fn number_key(chain_id: u16, number: u64) -> Vec<u8> {
    prefixed(chain_id, &number.to_be_bytes())
}

/// Persistent storage for ledger data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    accounts: Tree,

    tokens: Tree,

    /// Block data keyed by hash
    blocks: Tree,

    /// Block hash keyed by number
    block_numbers: Tree,

    /// One `BlockchainState` per chain
    chain_state: Tree,

    /// Pending transactions keyed by arrival sequence
    mempool: Tree,

    /// Mempool id -> mempool key
    mempool_ids: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a throwaway in-memory database
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            accounts: db.open_tree("accounts")?,
            tokens: db.open_tree("tokens")?,
            blocks: db.open_tree("blocks")?,
            block_numbers: db.open_tree("block_numbers")?,
            chain_state: db.open_tree("chain_state")?,
            mempool: db.open_tree("mempool")?,
            mempool_ids: db.open_tree("mempool_ids")?,
            db,
        })
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, StorageError> {
        match tree.get(key)? {
            Some(value) => decode(&value).map(Some),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(tree: &Tree, prefix: &[u8]) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (_, value) = entry?;
            items.push(decode(&value)?);
        }
        Ok(items)
    }

    pub fn get_account(&self, chain_id: u16, address: &Address) -> Result<Option<Account>, StorageError> {
        Self::get(&self.accounts, &account_key(chain_id, address))
    }

    #[cfg(test)]
    pub fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        self.accounts
            .insert(account_key(account.chain_id, &account.address), encode(account)?)?;
        Ok(())
    }

    pub fn list_accounts(&self, chain_id: u16) -> Result<Vec<Account>, StorageError> {
        Self::list(&self.accounts, &chain_key(chain_id))
    }

    pub fn get_token(&self, chain_id: u16, id: &BigNum) -> Result<Option<Token>, StorageError> {
        Self::get(&self.tokens, &token_key(chain_id, id))
    }

    pub fn list_tokens(&self, chain_id: u16) -> Result<Vec<Token>, StorageError> {
        Self::list(&self.tokens, &chain_key(chain_id))
    }

    pub fn get_block_by_hash(&self, chain_id: u16, hash: &Hash) -> Result<Option<BlockData>, StorageError> {
        Self::get(&self.blocks, &block_key(chain_id, hash))
    }

    pub fn get_block_by_number(&self, chain_id: u16, number: u64) -> Result<Option<BlockData>, StorageError> {
        match self.block_numbers.get(number_key(chain_id, number))? {
            Some(hash) => Self::get(&self.blocks, &prefixed(chain_id, &hash)),
            None => Ok(None),
        }
    }

    /// All blocks of a chain in ascending number order
    pub fn list_blocks(&self, chain_id: u16) -> Result<Vec<BlockData>, StorageError> {
        let mut blocks = Vec::new();
        for entry in self.block_numbers.scan_prefix(chain_key(chain_id)) {
            let (_, hash) = entry?;
            if let Some(block) = Self::get(&self.blocks, &prefixed(chain_id, &hash))? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    pub fn get_chain_state(&self, chain_id: u16) -> Result<Option<BlockchainState>, StorageError> {
        Self::get(&self.chain_state, &chain_key(chain_id))
    }

    /// Opens a staged write set for `chain_id`
    pub fn begin(&self, chain_id: u16) -> LedgerTxn<'_> {
        LedgerTxn {
            storage: self,
            chain_id,
            accounts: BTreeMap::new(),
            tokens: BTreeMap::new(),
        }
    }

    /// Lands the staged accounts and tokens, the block and the new head in
    /// one database transaction.
    ///
    /// `expected_parent` is the head hash the block was built on (`None`
    /// for genesis). The write is refused if the head moved, if the block
    /// number is taken, or if a token nonce would go backwards.
    pub fn commit_block(
        &self,
        txn: LedgerTxn<'_>,
        block: &BlockData,
        state: &BlockchainState,
        expected_parent: Option<Hash>,
    ) -> Result<(), StorageError> {
        let chain_id = txn.chain_id;

        let account_writes = txn
            .accounts
            .values()
            .map(|a| Ok((account_key(chain_id, &a.address), encode(a)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let token_writes = txn
            .tokens
            .values()
            .map(|t| Ok((token_key(chain_id, &t.id), encode(t)?, t)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let head_key = chain_key(chain_id);
        let head_value = encode(state)?;
        let block_bytes = encode(block)?;
        let hash_key = block_key(chain_id, &block.hash);
        let num_key = number_key(chain_id, block.header.number);

        let result = (
            &self.accounts,
            &self.tokens,
            &self.blocks,
            &self.block_numbers,
            &self.chain_state,
        )
            .transaction(|(accounts, tokens, blocks, numbers, heads)| {
                let current = match heads.get(&head_key)? {
                    Some(bytes) => match decode::<BlockchainState>(&bytes) {
                        Ok(head) => Some(head.latest_hash),
                        Err(e) => return abort(e),
                    },
                    None => None,
                };
                if current != expected_parent {
                    return abort(StorageError::Conflict(format!(
                        "chain {} head is {:?}, block was built on {:?}",
                        chain_id, current, expected_parent
                    )));
                }

                if numbers.get(&num_key)?.is_some() {
                    return abort(StorageError::Conflict(format!(
                        "block number {} already exists",
                        block.header.number
                    )));
                }

                for (key, value, token) in &token_writes {
                    if let Some(existing) = tokens.get(key)? {
                        let stored: Token = match decode(&existing) {
                            Ok(stored) => stored,
                            Err(e) => return abort(e),
                        };
                        if let Err(e) = stored.check_upsert(token) {
                            return abort(StorageError::StaleTokenWrite(e));
                        }
                    }
                    tokens.insert(key.as_slice(), value.as_slice())?;
                }

                for (key, value) in &account_writes {
                    accounts.insert(key.as_slice(), value.as_slice())?;
                }

                blocks.insert(hash_key.as_slice(), block_bytes.as_slice())?;
                numbers.insert(num_key.as_slice(), block.hash.as_bytes())?;
                heads.insert(head_key.as_slice(), head_value.as_slice())?;
                Ok(())
            });

        flatten_transaction(result)?;
        debug!(
            "Committed block {} on chain {} ({} accounts, {} tokens)",
            block.header.number,
            chain_id,
            account_writes.len(),
            token_writes.len()
        );
        Ok(())
    }

    /// Monotonic id used to order mempool arrivals
    pub fn generate_id(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()?)
    }

    pub fn upsert_mempool(&self, transaction: &MempoolTransaction) -> Result<(), StorageError> {
        let key = prefixed(transaction.signed.transaction.chain_id, &transaction.sequence.to_be_bytes());
        let value = encode(transaction)?;
        let id = transaction.id.as_bytes();

        let result = (&self.mempool, &self.mempool_ids).transaction(|(pool, ids)| {
            pool.insert(key.as_slice(), value.as_slice())?;
            ids.insert(id, key.as_slice())?;
            Ok(())
        });
        flatten_transaction(result)
    }

    pub fn get_mempool(&self, id: &str) -> Result<Option<MempoolTransaction>, StorageError> {
        match self.mempool_ids.get(id.as_bytes())? {
            Some(key) => Self::get(&self.mempool, &key),
            None => Ok(None),
        }
    }

    /// Pending transactions of a chain in arrival order.
    ///
    /// Undecodable entries are skipped with a warning.
    pub fn list_mempool(&self, chain_id: u16) -> Result<Vec<MempoolTransaction>, StorageError> {
        let mut transactions = Vec::new();
        for entry in self.mempool.scan_prefix(chain_key(chain_id)) {
            let (key, value) = entry?;
            match decode::<MempoolTransaction>(&value) {
                Ok(transaction) => transactions.push(transaction),
                Err(e) => warn!("Skipping mempool entry {}: {}", hex::encode(&key), e),
            }
        }
        Ok(transactions)
    }

    /// Removes a mempool entry; returns whether it existed
    pub fn delete_mempool(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.as_bytes();
        let result = (&self.mempool, &self.mempool_ids).transaction(|(pool, ids)| {
            match ids.remove(id)? {
                Some(key) => {
                    pool.remove(key)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        });
        flatten_transaction(result)
    }

    /// Change notifications for one chain's mempool
    pub fn watch_mempool(&self, chain_id: u16) -> Subscriber {
        self.mempool.watch_prefix(chain_key(chain_id))
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn flatten_transaction<T>(result: Result<T, TransactionError<StorageError>>) -> Result<T, StorageError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(StorageError::DatabaseError(e)),
    }
}

impl LedgerSource for BlockchainStorage {
    fn accounts(&self, chain_id: u16) -> Result<Vec<Account>, StorageError> {
        self.list_accounts(chain_id)
    }

    fn tokens(&self, chain_id: u16) -> Result<Vec<Token>, StorageError> {
        self.list_tokens(chain_id)
    }
}

/// Account and token writes staged on top of storage.
///
/// Reads see staged values first. Nothing reaches the database until the
/// set is handed to [`BlockchainStorage::commit_block`]; dropping it
/// discards every change.
pub struct LedgerTxn<'a> {
    storage: &'a BlockchainStorage,
    chain_id: u16,
    accounts: BTreeMap<Address, Account>,
    tokens: BTreeMap<BigNum, Token>,
}

impl<'a> LedgerTxn<'a> {
    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        if let Some(account) = self.accounts.get(address) {
            return Ok(Some(account.clone()));
        }
        self.storage.get_account(self.chain_id, address)
    }

    /// The account at `address`, or a fresh empty one
    pub fn account_or_default(&self, address: &Address) -> Result<Account, StorageError> {
        Ok(self
            .account(address)?
            .unwrap_or_else(|| Account::new(self.chain_id, *address)))
    }

    pub fn put_account(&mut self, account: Account) {
        self.accounts.insert(account.address, account);
    }

    pub fn token(&self, id: &BigNum) -> Result<Option<Token>, StorageError> {
        if let Some(token) = self.tokens.get(id) {
            return Ok(Some(token.clone()));
        }
        self.storage.get_token(self.chain_id, id)
    }

    /// Stages a token write, rejecting one that moves the nonce backwards
    pub fn put_token(&mut self, token: Token) -> Result<(), StorageError> {
        if let Some(current) = self.token(&token.id)? {
            current.check_upsert(&token).map_err(StorageError::StaleTokenWrite)?;
        }
        self.tokens.insert(token.id.clone(), token);
        Ok(())
    }

    /// Drops every staged change
    pub fn discard(self) {
        debug!(
            "Discarding {} staged accounts and {} staged tokens on chain {}",
            self.accounts.len(),
            self.tokens.len(),
            self.chain_id
        );
    }
}

impl<'a> LedgerSource for LedgerTxn<'a> {
    fn accounts(&self, chain_id: u16) -> Result<Vec<Account>, StorageError> {
        let mut merged: BTreeMap<Address, Account> = self
            .storage
            .list_accounts(chain_id)?
            .into_iter()
            .map(|a| (a.address, a))
            .collect();
        if chain_id == self.chain_id {
            merged.extend(self.accounts.iter().map(|(k, v)| (*k, v.clone())));
        }
        Ok(merged.into_values().collect())
    }

    fn tokens(&self, chain_id: u16) -> Result<Vec<Token>, StorageError> {
        let mut merged: BTreeMap<BigNum, Token> = self
            .storage
            .list_tokens(chain_id)?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        if chain_id == self.chain_id {
            merged.extend(self.tokens.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::tests::sealed_block;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::state_hash::StateHasher;

    const CHAIN: u16 = 1;

    fn funded(address: Address, balance: u64) -> Account {
        let mut account = Account::new(CHAIN, address);
        account.balance = balance;
        account
    }

    fn genesis_commit(storage: &BlockchainStorage, wallet: &Wallet) -> BlockData {
        let block = sealed_block(wallet, 0, Hash::ZERO, 1);
        let data = BlockData::new(&block).unwrap();
        let state = BlockchainState::from_block(&block).unwrap();
        let mut txn = storage.begin(CHAIN);
        txn.put_account(funded(wallet.address(), 1_000));
        storage.commit_block(txn, &data, &state, None).unwrap();
        data
    }

    #[test]
    fn test_missing_entries_are_none() {
        let storage = BlockchainStorage::temporary().unwrap();
        let address = Wallet::new().address();
        assert!(storage.get_account(CHAIN, &address).unwrap().is_none());
        assert!(storage.get_token(CHAIN, &BigNum::zero()).unwrap().is_none());
        assert!(storage.get_chain_state(CHAIN).unwrap().is_none());
        assert!(storage.get_block_by_number(CHAIN, 0).unwrap().is_none());
        assert!(storage.get_mempool("nope").unwrap().is_none());
    }

    #[test]
    fn test_accounts_are_scoped_by_chain() {
        let storage = BlockchainStorage::temporary().unwrap();
        let address = Wallet::new().address();
        storage.upsert_account(&funded(address, 10)).unwrap();

        let mut other = funded(address, 99);
        other.chain_id = CHAIN + 1;
        storage.upsert_account(&other).unwrap();

        assert_eq!(storage.get_account(CHAIN, &address).unwrap().unwrap().balance, 10);
        assert_eq!(storage.list_accounts(CHAIN).unwrap().len(), 1);
        assert_eq!(storage.list_accounts(CHAIN + 1).unwrap()[0].balance, 99);
    }

    #[test]
    fn test_token_upsert_rejects_stale_nonce() {
        let storage = BlockchainStorage::temporary().unwrap();
        let owner = Wallet::new().address();
        let minted = Token::mint(CHAIN, BigNum::from_u64(1), owner, "ipfs://1");
        let mut moved = minted.clone();
        moved.transfer(Wallet::new().address());

        let mut txn = storage.begin(CHAIN);
        txn.put_token(moved.clone()).unwrap();
        let err = txn.put_token(minted).unwrap_err();
        assert!(matches!(err, StorageError::StaleTokenWrite(_)));
        assert_eq!(txn.token(&BigNum::from_u64(1)).unwrap().unwrap(), moved);
    }

    #[test]
    fn test_staged_reads_and_discard() {
        let storage = BlockchainStorage::temporary().unwrap();
        let address = Wallet::new().address();
        storage.upsert_account(&funded(address, 10)).unwrap();

        let mut txn = storage.begin(CHAIN);
        let mut account = txn.account_or_default(&address).unwrap();
        account.balance = 3;
        txn.put_account(account);

        assert_eq!(txn.account(&address).unwrap().unwrap().balance, 3);
        let staged_root = StateHasher::new(&txn, CHAIN).account_hash_state().unwrap();
        txn.discard();

        assert_eq!(storage.get_account(CHAIN, &address).unwrap().unwrap().balance, 10);
        let stored_root = StateHasher::new(&storage, CHAIN).account_hash_state().unwrap();
        assert_ne!(staged_root, stored_root);
    }

    #[test]
    fn test_commit_lands_everything() {
        let storage = BlockchainStorage::temporary().unwrap();
        let wallet = Wallet::new();
        let data = genesis_commit(&storage, &wallet);

        let head = storage.get_chain_state(CHAIN).unwrap().unwrap();
        assert_eq!(head.latest_block_number, 0);
        assert_eq!(head.latest_hash, Hash::ZERO);
        assert_eq!(storage.get_block_by_hash(CHAIN, &Hash::ZERO).unwrap().unwrap(), data);
        assert_eq!(storage.get_block_by_number(CHAIN, 0).unwrap().unwrap(), data);
        assert_eq!(
            storage.get_account(CHAIN, &wallet.address()).unwrap().unwrap().balance,
            1_000
        );
    }

    #[test]
    fn test_commit_refused_when_head_moved() {
        let storage = BlockchainStorage::temporary().unwrap();
        let wallet = Wallet::new();
        genesis_commit(&storage, &wallet);

        let block = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let data = BlockData::new(&block).unwrap();
        let state = BlockchainState::from_block(&block).unwrap();

        let mut txn = storage.begin(CHAIN);
        txn.put_account(funded(wallet.address(), 1));
        let err = storage
            .commit_block(txn, &data, &state, Some(Hash::digest(b"stale head")))
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Nothing from the refused write is visible
        assert!(storage.get_block_by_number(CHAIN, 2).unwrap().is_none());
        assert_eq!(storage.get_chain_state(CHAIN).unwrap().unwrap().latest_block_number, 0);
        assert_eq!(
            storage.get_account(CHAIN, &wallet.address()).unwrap().unwrap().balance,
            1_000
        );
    }

    #[test]
    fn test_second_genesis_refused() {
        let storage = BlockchainStorage::temporary().unwrap();
        let wallet = Wallet::new();
        let data = genesis_commit(&storage, &wallet);
        let state = storage.get_chain_state(CHAIN).unwrap().unwrap();
        let err = storage
            .commit_block(storage.begin(CHAIN), &data, &state, None)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_mempool_ordering_and_delete() {
        let storage = BlockchainStorage::temporary().unwrap();
        let wallet = Wallet::new();
        let mut ids = Vec::new();
        for nonce in 0..3u64 {
            let signed = crate::blockchain::transaction::Transaction::coin(
                CHAIN,
                nonce,
                wallet.address(),
                Wallet::new().address(),
                5,
            )
            .sign(&wallet)
            .unwrap();
            let entry = MempoolTransaction::new(signed, storage.generate_id().unwrap());
            ids.push(entry.id.clone());
            storage.upsert_mempool(&entry).unwrap();
        }

        let pending = storage.list_mempool(CHAIN).unwrap();
        let pending_ids: Vec<String> = pending.iter().map(|m| m.id.clone()).collect();
        assert_eq!(pending_ids, ids);

        assert!(storage.delete_mempool(&ids[1]).unwrap());
        assert!(!storage.delete_mempool(&ids[1]).unwrap());
        assert!(storage.get_mempool(&ids[1]).unwrap().is_none());
        assert_eq!(storage.list_mempool(CHAIN).unwrap().len(), 2);
    }
}
