use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::bignum::BigNum;
use super::crypto::{keccak256, recover_address, Address, CryptoError, Hash, Signature, Wallet};

/// Errors that can occur during transaction validation and signing
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u16, got: u16 },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Coin transactions must carry a non-zero value")]
    ZeroValue,

    #[error("Unknown transaction type: {0}")]
    UnknownType(String),

    #[error("Token transactions must carry a metadata URI")]
    MissingMetadataUri,

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Signature does not belong to sender: recovered {recovered}, claimed {claimed}")]
    SignerMismatch { recovered: Address, claimed: Address },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

impl TransactionError {
    /// Name of the offending request field, used for field-level error maps
    pub fn field(&self) -> &'static str {
        match self {
            TransactionError::ChainIdMismatch { .. } => "chain_id",
            TransactionError::MissingField(field) => *field,
            TransactionError::InvalidSenderAddress(_) => "from",
            TransactionError::InvalidRecipientAddress(_) => "to",
            TransactionError::ZeroValue => "value",
            TransactionError::UnknownType(_) => "type",
            TransactionError::MissingMetadataUri => "token_metadata_uri",
            TransactionError::NotSigned
            | TransactionError::SignerMismatch { .. }
            | TransactionError::CryptoError(_) => "signature",
            TransactionError::EncodingError(_) => "transaction",
        }
    }
}

/// Name of the coin transaction type on the wire
pub const COIN_TYPE: &str = "coin";

/// Name of the token transaction type on the wire
pub const TOKEN_TYPE: &str = "token";

/// What a transaction moves: coins, or one non-fungible token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// `value` is the amount committed plus the protocol fee.
    Coin,

    /// `value` is the fee only. Minting, transferring and burning are
    /// distinguished by the current token state and the recipient.
    Token {
        token_id: BigNum,
        metadata_uri: String,
        token_nonce: BigNum,
    },
}

impl TransactionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TransactionKind::Coin => COIN_TYPE,
            TransactionKind::Token { .. } => TOKEN_TYPE,
        }
    }
}

/// Immutable transaction payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub chain_id: u16,

    /// Sender account nonce used for replay protection
    pub nonce: BigNum,

    pub from: Address,

    pub to: Address,

    pub value: u64,

    #[serde(default)]
    pub data: Vec<u8>,

    pub kind: TransactionKind,
}

impl Transaction {
    /// Creates a coin transfer
    pub fn coin(chain_id: u16, nonce: impl Into<BigNum>, from: Address, to: Address, value: u64) -> Self {
        Transaction {
            chain_id,
            nonce: nonce.into(),
            from,
            to,
            value,
            data: Vec::new(),
            kind: TransactionKind::Coin,
        }
    }

    /// Creates a token mint, transfer or burn paying `fee`
    #[allow(clippy::too_many_arguments)]
    pub fn token(
        chain_id: u16,
        nonce: impl Into<BigNum>,
        from: Address,
        to: Address,
        fee: u64,
        token_id: BigNum,
        metadata_uri: impl Into<String>,
        token_nonce: BigNum,
    ) -> Self {
        Transaction {
            chain_id,
            nonce: nonce.into(),
            from,
            to,
            value: fee,
            data: Vec::new(),
            kind: TransactionKind::Token {
                token_id,
                metadata_uri: metadata_uri.into(),
                token_nonce,
            },
        }
    }

    /// Keccak-256 of the canonical encoding; this is what gets stamped and signed
    pub fn digest(&self) -> Result<[u8; 32], TransactionError> {
        let bytes = bincode::serialize(self).map_err(|e| TransactionError::EncodingError(e.to_string()))?;
        Ok(keccak256(&bytes))
    }

    /// Signs the transaction with a wallet
    pub fn sign(self, wallet: &Wallet) -> Result<SignedTransaction, TransactionError> {
        if wallet.address() != self.from {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match sender address".to_string(),
            ));
        }

        let signature = wallet.sign_digest(&self.digest()?)?;
        Ok(SignedTransaction {
            transaction: self,
            signature,
        })
    }

    /// Checks the payload against the running chain
    pub fn validate(&self, chain_id: u16) -> Result<(), TransactionError> {
        if self.chain_id != chain_id {
            return Err(TransactionError::ChainIdMismatch {
                expected: chain_id,
                got: self.chain_id,
            });
        }

        if self.from.is_zero() {
            return Err(TransactionError::InvalidSenderAddress(
                "sender cannot be the zero address".to_string(),
            ));
        }

        match &self.kind {
            TransactionKind::Coin => {
                if self.to.is_zero() {
                    return Err(TransactionError::InvalidRecipientAddress(
                        "coins cannot be sent to the zero address".to_string(),
                    ));
                }
                if self.value == 0 {
                    return Err(TransactionError::ZeroValue);
                }
            }
            TransactionKind::Token { metadata_uri, .. } => {
                if metadata_uri.trim().is_empty() {
                    return Err(TransactionError::MissingMetadataUri);
                }
            }
        }

        Ok(())
    }
}

/// A transaction with its ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,

    pub signature: Signature,
}

impl SignedTransaction {
    /// Recovers the address that signed the transaction
    pub fn from_address(&self) -> Result<Address, TransactionError> {
        if !self.signature.is_present() {
            return Err(TransactionError::NotSigned);
        }
        Ok(recover_address(&self.transaction.digest()?, &self.signature)?)
    }

    /// Validates the payload and, when required, that the signature is
    /// present and was produced by `from`
    pub fn validate(&self, chain_id: u16, require_signature: bool) -> Result<(), TransactionError> {
        self.transaction.validate(chain_id)?;

        if !require_signature {
            return Ok(());
        }

        let recovered = self.from_address()?;
        if recovered != self.transaction.from {
            return Err(TransactionError::SignerMismatch {
                recovered,
                claimed: self.transaction.from,
            });
        }

        Ok(())
    }

    /// Content hash used as the Merkle leaf
    pub fn hash(&self) -> Result<Hash, TransactionError> {
        let bytes = bincode::serialize(self).map_err(|e| TransactionError::EncodingError(e.to_string()))?;
        Ok(Hash::digest(&bytes))
    }
}

/// A signed transaction waiting in the mempool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolTransaction {
    pub id: String,

    /// Arrival order within the mempool
    pub sequence: u64,

    pub signed: SignedTransaction,
}

impl MempoolTransaction {
    pub fn new(signed: SignedTransaction, sequence: u64) -> Self {
        MempoolTransaction {
            id: Uuid::new_v4().to_string(),
            sequence,
            signed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: u16 = 7;

    fn coin_from(wallet: &Wallet, value: u64) -> Transaction {
        Transaction::coin(CHAIN, 0, wallet.address(), Wallet::new().address(), value)
    }

    #[test]
    fn test_sign_and_recover_sender() {
        let wallet = Wallet::new();
        let signed = coin_from(&wallet, 10).sign(&wallet).unwrap();

        assert_eq!(signed.from_address().unwrap(), wallet.address());
        assert!(signed.validate(CHAIN, true).is_ok());
    }

    #[test]
    fn test_sign_with_foreign_wallet_fails() {
        let wallet = Wallet::new();
        let tx = coin_from(&wallet, 10);
        assert!(matches!(
            tx.sign(&Wallet::new()),
            Err(TransactionError::InvalidSenderAddress(_))
        ));
    }

    #[test]
    fn test_tampered_transaction_fails_signer_check() {
        let wallet = Wallet::new();
        let mut signed = coin_from(&wallet, 10).sign(&wallet).unwrap();
        signed.transaction.value = 1_000;

        let result = signed.validate(CHAIN, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_chain_id_mismatch() {
        let wallet = Wallet::new();
        let signed = coin_from(&wallet, 10).sign(&wallet).unwrap();
        let err = signed.validate(CHAIN + 1, true).unwrap_err();
        assert!(matches!(err, TransactionError::ChainIdMismatch { .. }));
        assert_eq!(err.field(), "chain_id");
    }

    #[test]
    fn test_zero_value_coin_rejected() {
        let wallet = Wallet::new();
        let err = coin_from(&wallet, 0).validate(CHAIN).unwrap_err();
        assert!(matches!(err, TransactionError::ZeroValue));
    }

    #[test]
    fn test_zero_sender_rejected() {
        let tx = Transaction::coin(CHAIN, 0, Address::ZERO, Wallet::new().address(), 5);
        let err = tx.validate(CHAIN).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidSenderAddress(_)));
        assert_eq!(err.field(), "from");
    }

    #[test]
    fn test_zero_coin_recipient_rejected() {
        let wallet = Wallet::new();
        let tx = Transaction::coin(CHAIN, 0, wallet.address(), Address::ZERO, 5);
        let err = tx.validate(CHAIN).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidRecipientAddress(_)));
        assert_eq!(err.field(), "to");

        // Sending a token to the zero address is a burn and stays valid
        let burn = Transaction::token(
            CHAIN,
            0,
            wallet.address(),
            Address::ZERO,
            0,
            BigNum::from_u64(1),
            "ipfs://token-1",
            BigNum::from_u64(1),
        );
        assert!(burn.validate(CHAIN).is_ok());
    }

    #[test]
    fn test_zero_value_token_allowed() {
        let wallet = Wallet::new();
        let tx = Transaction::token(
            CHAIN,
            0,
            wallet.address(),
            wallet.address(),
            0,
            BigNum::from_u64(1),
            "ipfs://token-1",
            BigNum::zero(),
        );
        assert!(tx.validate(CHAIN).is_ok());
    }

    #[test]
    fn test_token_without_metadata_rejected() {
        let wallet = Wallet::new();
        let tx = Transaction::token(
            CHAIN,
            0,
            wallet.address(),
            wallet.address(),
            1,
            BigNum::from_u64(1),
            "",
            BigNum::zero(),
        );
        assert!(matches!(tx.validate(CHAIN), Err(TransactionError::MissingMetadataUri)));
    }

    #[test]
    fn test_unsigned_rejected_only_when_required() {
        let wallet = Wallet::new();
        let unsigned = SignedTransaction {
            transaction: coin_from(&wallet, 5),
            signature: Signature::default(),
        };
        assert!(unsigned.validate(CHAIN, false).is_ok());
        assert!(matches!(unsigned.validate(CHAIN, true), Err(TransactionError::NotSigned)));
    }

    #[test]
    fn test_json_and_binary_forms_agree() {
        let wallet = Wallet::new();
        let signed = Transaction::token(
            CHAIN,
            3,
            wallet.address(),
            Address::ZERO,
            2,
            BigNum::from_u64(9),
            "ipfs://nine",
            BigNum::from_u64(4),
        )
        .sign(&wallet)
        .unwrap();

        let value = serde_json::to_value(&signed).unwrap();
        assert_eq!(value["transaction"]["kind"]["token"]["token_id"], "9");
        assert_eq!(value["transaction"]["from"], wallet.address().to_string());

        let from_json: SignedTransaction = serde_json::from_value(value).unwrap();
        let from_bincode: SignedTransaction =
            bincode::deserialize(&bincode::serialize(&signed).unwrap()).unwrap();
        assert_eq!(from_json, signed);
        assert_eq!(from_bincode, signed);
        assert_eq!(from_bincode.hash().unwrap(), signed.hash().unwrap());
    }
}
