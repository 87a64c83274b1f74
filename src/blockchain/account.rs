use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bignum::BigNum;
use super::crypto::Address;

/// Errors raised when a transaction is not permitted against the current
/// account or token state
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds in {address}: required {required}, available {available}")]
    InsufficientFunds {
        address: Address,
        required: u64,
        available: u64,
    },

    #[error("Balance overflow crediting {0}")]
    BalanceOverflow(Address),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: Address,
        expected: BigNum,
        got: BigNum,
    },

    #[error("Token {token_id} is owned by {owner}, not {claimed}")]
    NotTokenOwner {
        token_id: BigNum,
        owner: Address,
        claimed: Address,
    },

    #[error("Token {token_id} nonce mismatch: expected {expected}, got {got}")]
    TokenNonceMismatch {
        token_id: BigNum,
        expected: BigNum,
        got: BigNum,
    },

    #[error("Token {token_id} has a stored nonce {stored} newer than {incoming}")]
    StaleTokenNonce {
        token_id: BigNum,
        stored: BigNum,
        incoming: BigNum,
    },

    #[error("Token {0} has been burned")]
    TokenBurned(BigNum),

    #[error("Next mintable token id is {expected}, got {got}")]
    UnexpectedMintId { expected: BigNum, got: BigNum },
}

impl LedgerError {
    /// Name of the offending request field, used for field-level error maps
    pub fn field(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. }
            | LedgerError::BalanceOverflow(_)
            | LedgerError::InvalidAmount(_) => "value",
            LedgerError::InvalidNonce { .. } => "nonce",
            LedgerError::NotTokenOwner { .. } | LedgerError::TokenBurned(_) => "from",
            LedgerError::TokenNonceMismatch { .. } | LedgerError::StaleTokenNonce { .. } => "token_nonce",
            LedgerError::UnexpectedMintId { .. } => "token_id",
        }
    }
}

/// Represents an account in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub chain_id: u16,

    /// The account's address
    pub address: Address,

    /// The account's nonce (used to prevent replay attacks)
    pub nonce: BigNum,

    /// The account's balance
    pub balance: u64,
}

impl Account {
    /// Creates an empty account; accounts come into existence on first credit
    pub fn new(chain_id: u16, address: Address) -> Self {
        Account {
            chain_id,
            address,
            nonce: BigNum::zero(),
            balance: 0,
        }
    }

    /// Increases the account's balance
    pub fn deposit(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("Amount must be positive".to_string()));
        }

        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow(self.address))?;
        Ok(())
    }

    /// Decreases the account's balance
    pub fn withdraw(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("Amount must be positive".to_string()));
        }

        if !self.has_sufficient_funds(amount) {
            return Err(LedgerError::InsufficientFunds {
                address: self.address,
                required: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        Ok(())
    }

    /// Increments the account's nonce
    pub fn increment_nonce(&mut self) {
        self.nonce = self.nonce.increment();
    }

    /// Checks if the account has sufficient funds
    pub fn has_sufficient_funds(&self, amount: u64) -> bool {
        self.balance >= amount
    }

    /// The next transaction from this account must carry exactly this nonce
    pub fn is_valid_nonce(&self, nonce: &BigNum) -> bool {
        *nonce == self.nonce
    }
}

/// A non-fungible token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub chain_id: u16,

    pub id: BigNum,

    /// Current owner; the zero address once burned
    pub owner: Address,

    pub metadata_uri: String,

    /// 0 at mint, +1 for every transfer or burn
    pub nonce: BigNum,
}

impl Token {
    /// A freshly minted token at nonce 0
    pub fn mint(chain_id: u16, id: BigNum, owner: Address, metadata_uri: impl Into<String>) -> Self {
        Token {
            chain_id,
            id,
            owner,
            metadata_uri: metadata_uri.into(),
            nonce: BigNum::zero(),
        }
    }

    pub fn is_burned(&self) -> bool {
        self.owner.is_zero()
    }

    /// Hands the token to `to`, bumping its nonce. Sending to the zero
    /// address burns it; the record stays so its history remains auditable.
    pub fn transfer(&mut self, to: Address) {
        self.owner = to;
        self.nonce = self.nonce.increment();
    }

    /// Burns the token
    pub fn burn(&mut self) {
        self.transfer(Address::ZERO);
    }

    /// Checks that `from` may move this token with `token_nonce`
    pub fn authorize(&self, from: &Address, token_nonce: &BigNum) -> Result<(), LedgerError> {
        if self.is_burned() {
            return Err(LedgerError::TokenBurned(self.id.clone()));
        }

        if self.owner != *from {
            return Err(LedgerError::NotTokenOwner {
                token_id: self.id.clone(),
                owner: self.owner,
                claimed: *from,
            });
        }

        let expected = self.nonce.increment();
        if *token_nonce != expected {
            return Err(LedgerError::TokenNonceMismatch {
                token_id: self.id.clone(),
                expected,
                got: token_nonce.clone(),
            });
        }

        Ok(())
    }

    /// An upsert carrying `incoming` may replace a record holding `self`
    /// only when it does not move the nonce backwards
    pub fn check_upsert(&self, incoming: &Token) -> Result<(), LedgerError> {
        if incoming.nonce < self.nonce {
            return Err(LedgerError::StaleTokenNonce {
                token_id: self.id.clone(),
                stored: self.nonce.clone(),
                incoming: incoming.nonce.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    #[test]
    fn test_account_creation() {
        let address = Wallet::new().address();
        let account = Account::new(1, address);

        assert_eq!(account.address, address);
        assert_eq!(account.balance, 0);
        assert!(account.nonce.is_zero());
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut account = Account::new(1, Wallet::new().address());

        account.deposit(100).unwrap();
        assert_eq!(account.balance, 100);

        account.withdraw(50).unwrap();
        assert_eq!(account.balance, 50);

        let result = account.withdraw(100);
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        assert_eq!(account.balance, 50);
    }

    #[test]
    fn test_deposit_overflow() {
        let mut account = Account::new(1, Wallet::new().address());
        account.deposit(u64::MAX).unwrap();
        assert!(matches!(account.deposit(1), Err(LedgerError::BalanceOverflow(_))));
    }

    #[test]
    fn test_nonce_check() {
        let mut account = Account::new(1, Wallet::new().address());
        assert!(account.is_valid_nonce(&BigNum::zero()));
        account.increment_nonce();
        assert!(!account.is_valid_nonce(&BigNum::zero()));
        assert!(account.is_valid_nonce(&BigNum::from_u64(1)));
    }

    #[test]
    fn test_token_nonce_advances_by_one() {
        let owner = Wallet::new().address();
        let next_owner = Wallet::new().address();
        let mut token = Token::mint(1, BigNum::from_u64(1), owner, "ipfs://one");
        assert!(token.nonce.is_zero());

        assert!(token.authorize(&owner, &BigNum::from_u64(1)).is_ok());
        token.transfer(next_owner);
        assert_eq!(token.nonce, BigNum::from_u64(1));

        // Replaying the previous operation is rejected
        assert!(matches!(
            token.authorize(&next_owner, &BigNum::from_u64(1)),
            Err(LedgerError::TokenNonceMismatch { .. })
        ));
        assert!(token.authorize(&next_owner, &BigNum::from_u64(2)).is_ok());
    }

    #[test]
    fn test_only_owner_may_move_token() {
        let owner = Wallet::new().address();
        let token = Token::mint(1, BigNum::from_u64(3), owner, "ipfs://three");
        let thief = Wallet::new().address();
        assert!(matches!(
            token.authorize(&thief, &BigNum::from_u64(1)),
            Err(LedgerError::NotTokenOwner { .. })
        ));
    }

    #[test]
    fn test_burn_keeps_record() {
        let owner = Wallet::new().address();
        let mut token = Token::mint(1, BigNum::from_u64(2), owner, "ipfs://two");
        token.burn();

        assert!(token.is_burned());
        assert_eq!(token.nonce, BigNum::from_u64(1));
        assert_eq!(token.metadata_uri, "ipfs://two");
        assert!(matches!(
            token.authorize(&owner, &BigNum::from_u64(2)),
            Err(LedgerError::TokenBurned(_))
        ));
    }

    #[test]
    fn test_upsert_rejects_older_nonce() {
        let owner = Wallet::new().address();
        let mut stored = Token::mint(1, BigNum::from_u64(5), owner, "ipfs://five");
        let older = stored.clone();
        stored.transfer(Wallet::new().address());

        assert!(stored.check_upsert(&older).is_err());
        assert!(older.check_upsert(&stored).is_ok());
        assert!(stored.check_upsert(&stored.clone()).is_ok());
    }
}
