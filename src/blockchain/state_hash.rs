//! Deterministic hashing of the full account and token sets.
//!
//! Entries are filtered, sorted by key and encoded with bincode, whose
//! output depends only on field declaration order. The concatenation is
//! hashed once with SHA-256.

use thiserror::Error;

use super::account::{Account, Token};
use super::crypto::Hash;
use super::storage::StorageError;

/// Errors that can occur while hashing state
#[derive(Debug, Error)]
pub enum StateHashError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Anything that can list the current account and token sets of a chain
pub trait LedgerSource {
    fn accounts(&self, chain_id: u16) -> Result<Vec<Account>, StorageError>;
    fn tokens(&self, chain_id: u16) -> Result<Vec<Token>, StorageError>;
}

/// Root over all accounts holding a positive balance, ordered by address
pub fn accounts_root(accounts: Vec<Account>) -> Result<Hash, StateHashError> {
    let mut funded: Vec<Account> = accounts.into_iter().filter(|a| a.balance > 0).collect();
    funded.sort_by(|a, b| a.address.cmp(&b.address));
    hash_concatenated(&funded)
}

/// Root over all tokens (burned ones included), ordered by id
pub fn tokens_root(tokens: Vec<Token>) -> Result<Hash, StateHashError> {
    let mut tokens = tokens;
    tokens.sort_by(|a, b| a.id.cmp(&b.id));
    hash_concatenated(&tokens)
}

fn hash_concatenated<T: serde::Serialize>(entries: &[T]) -> Result<Hash, StateHashError> {
    let mut buffer = Vec::new();
    for entry in entries {
        let bytes = bincode::serialize(entry)
            .map_err(|e| StateHashError::SerializationError(e.to_string()))?;
        buffer.extend_from_slice(&bytes);
    }
    Ok(Hash::digest(&buffer))
}

/// Computes both state roots of a chain from a ledger source
pub struct StateHasher<'a, S: LedgerSource + ?Sized> {
    source: &'a S,
    chain_id: u16,
}

impl<'a, S: LedgerSource + ?Sized> StateHasher<'a, S> {
    pub fn new(source: &'a S, chain_id: u16) -> Self {
        StateHasher { source, chain_id }
    }

    /// `stateRoot` / `accountHashState`
    pub fn account_hash_state(&self) -> Result<Hash, StateHashError> {
        accounts_root(self.source.accounts(self.chain_id)?)
    }

    /// `tokensRoot` / `tokenHashState`
    pub fn token_hash_state(&self) -> Result<Hash, StateHashError> {
        tokens_root(self.source.tokens(self.chain_id)?)
    }
}
