use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::account::{Account, Token};
use crate::blockchain::bignum::BigNum;
use crate::blockchain::block::{BlockData, BlockchainState};
use crate::blockchain::crypto::{Address, Signature};
use crate::blockchain::transaction::{
    MempoolTransaction, SignedTransaction, Transaction, TransactionError, TransactionKind, COIN_TYPE, TOKEN_TYPE,
};

/// Field name to message map returned on rejected requests
pub type FieldErrors = BTreeMap<String, String>;

/// A wrapper for DateTime<Utc> that implements ToSchema
/// Represents a timestamp in ISO 8601 format
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = "2023-01-01T12:00:00Z")]
pub struct DateTimeUtc(pub DateTime<Utc>);

impl DateTimeUtc {
    /// From Unix seconds; out-of-range values clamp to the epoch
    pub fn from_unix(seconds: u64) -> Self {
        let seconds = i64::try_from(seconds).unwrap_or(0);
        DateTimeUtc(Utc.timestamp_opt(seconds, 0).single().unwrap_or_default())
    }
}

/// Body of every rejected request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub errors: FieldErrors,
}

impl ErrorResponse {
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), message.into());
        ErrorResponse { errors }
    }
}

/// A signed transaction as submitted over HTTP.
///
/// Integers that may exceed 64 bits (nonces, token ids) travel as decimal
/// or `0x` hex strings. The signature is the 65-byte `r || s || v` form in
/// hex.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    pub chain_id: Option<u16>,

    /// `coin` or `token`
    #[serde(rename = "type")]
    pub kind: Option<String>,

    #[schema(example = "0")]
    pub nonce: Option<String>,

    #[schema(example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
    pub from: Option<String>,

    pub to: Option<String>,

    /// Coins moved, or the fee of a token transaction
    pub value: Option<u64>,

    pub token_id: Option<String>,

    pub token_metadata_uri: Option<String>,

    pub token_nonce: Option<String>,

    /// Opaque payload as hex, `0x` prefix optional
    #[schema(example = "0x")]
    pub data: Option<String>,

    pub signature: Option<String>,
}

fn reject(errors: &mut FieldErrors, error: TransactionError) {
    errors.insert(error.field().to_string(), error.to_string());
}

fn required<'a, T>(value: &'a Option<T>, field: &'static str, errors: &mut FieldErrors) -> Option<&'a T> {
    if value.is_none() {
        reject(errors, TransactionError::MissingField(field));
    }
    value.as_ref()
}

fn parse_field<T, E>(raw: Option<&String>, field: &str, errors: &mut FieldErrors) -> Option<T>
where
    T: std::str::FromStr<Err = E>,
    E: std::fmt::Display,
{
    match raw?.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            errors.insert(field.to_string(), e.to_string());
            None
        }
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    let digits = raw.trim().strip_prefix("0x").unwrap_or(raw.trim());
    hex::decode(digits).map_err(|e| e.to_string())
}

fn parse_signature(raw: &str) -> Result<Signature, String> {
    Signature::from_bytes(&decode_hex(raw)?).map_err(|e| e.to_string())
}

impl TransactionRequest {
    /// Parses every field, collecting all problems instead of stopping at
    /// the first one. Semantic checks happen later in the ledger.
    pub fn into_signed(self) -> Result<SignedTransaction, FieldErrors> {
        let mut errors = FieldErrors::new();

        let chain_id = required(&self.chain_id, "chain_id", &mut errors).copied();
        let nonce: Option<BigNum> = parse_field(required(&self.nonce, "nonce", &mut errors), "nonce", &mut errors);
        let from: Option<Address> = parse_field(required(&self.from, "from", &mut errors), "from", &mut errors);
        let to: Option<Address> = parse_field(required(&self.to, "to", &mut errors), "to", &mut errors);
        let value = required(&self.value, "value", &mut errors).copied();

        let signature = match required(&self.signature, "signature", &mut errors) {
            Some(raw) => match parse_signature(raw) {
                Ok(signature) => Some(signature),
                Err(e) => {
                    errors.insert("signature".to_string(), e);
                    None
                }
            },
            None => None,
        };

        let data = match self.data.as_deref().map(decode_hex) {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                errors.insert("data".to_string(), e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let token = match required(&self.kind, "type", &mut errors).map(String::as_str) {
            Some(COIN_TYPE) => None,
            Some(TOKEN_TYPE) => {
                let token_id: Option<BigNum> = parse_field(
                    required(&self.token_id, "token_id", &mut errors),
                    "token_id",
                    &mut errors,
                );
                let token_nonce: Option<BigNum> = parse_field(
                    required(&self.token_nonce, "token_nonce", &mut errors),
                    "token_nonce",
                    &mut errors,
                );
                let uri = required(&self.token_metadata_uri, "token_metadata_uri", &mut errors).cloned();
                Some((token_id, uri, token_nonce))
            }
            Some(other) => {
                reject(&mut errors, TransactionError::UnknownType(other.to_string()));
                None
            }
            None => None,
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        match (chain_id, nonce, from, to, value, signature) {
            (Some(chain_id), Some(nonce), Some(from), Some(to), Some(value), Some(signature)) => {
                let mut transaction = match token {
                    Some((Some(token_id), Some(uri), Some(token_nonce))) => {
                        Transaction::token(chain_id, nonce, from, to, value, token_id, uri, token_nonce)
                    }
                    _ => Transaction::coin(chain_id, nonce, from, to, value),
                };
                transaction.data = data;
                Ok(SignedTransaction { transaction, signature })
            }
            _ => Err(ErrorResponse::single("transaction", "incomplete transaction").errors),
        }
    }
}

/// A transaction as rendered in responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    pub hash: String,
    pub chain_id: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub nonce: String,
    pub from: String,
    pub to: String,
    pub value: u64,
    pub token_id: Option<String>,
    pub token_metadata_uri: Option<String>,
    pub token_nonce: Option<String>,
    /// `0x` hex payload
    pub data: String,
    pub signature: String,
}

impl From<&SignedTransaction> for TransactionView {
    fn from(signed: &SignedTransaction) -> Self {
        let tx = &signed.transaction;
        let (token_id, token_metadata_uri, token_nonce) = match &tx.kind {
            TransactionKind::Token {
                token_id,
                metadata_uri,
                token_nonce,
            } => (
                Some(token_id.to_string()),
                Some(metadata_uri.clone()),
                Some(token_nonce.to_string()),
            ),
            TransactionKind::Coin => (None, None, None),
        };
        TransactionView {
            hash: signed.hash().map(|h| h.to_hex()).unwrap_or_default(),
            chain_id: tx.chain_id,
            kind: tx.kind.type_name().to_string(),
            nonce: tx.nonce.to_string(),
            from: tx.from.to_string(),
            to: tx.to.to_string(),
            value: tx.value,
            token_id,
            token_metadata_uri,
            token_nonce,
            data: format!("0x{}", hex::encode(&tx.data)),
            signature: format!("0x{}", hex::encode(signed.signature.to_bytes())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    pub hash: String,
    pub number: u64,
    pub prev_block_hash: String,
    pub timestamp: u64,
    pub time: DateTimeUtc,
    pub difficulty: u16,
    pub nonce: u64,
    pub beneficiary: String,
    pub transaction_fee: u64,
    pub state_root: String,
    pub trans_root: String,
    pub tokens_root: String,
    pub latest_token_id: String,
    pub validator: String,
    pub transactions: Vec<TransactionView>,
}

impl From<&BlockData> for BlockView {
    fn from(data: &BlockData) -> Self {
        let header = &data.header;
        BlockView {
            hash: data.hash.to_hex(),
            number: header.number,
            prev_block_hash: header.prev_block_hash.to_hex(),
            timestamp: header.timestamp,
            time: DateTimeUtc::from_unix(header.timestamp),
            difficulty: header.difficulty,
            nonce: header.nonce,
            beneficiary: header.beneficiary.to_string(),
            transaction_fee: header.transaction_fee,
            state_root: header.state_root.to_hex(),
            trans_root: header.trans_root.to_hex(),
            tokens_root: header.tokens_root.to_hex(),
            latest_token_id: header.latest_token_id.to_string(),
            validator: data.validator.id.clone(),
            transactions: data.transactions.iter().map(TransactionView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StateView {
    pub chain_id: u16,
    pub latest_block_number: u64,
    pub latest_hash: String,
    pub latest_token_id: String,
    pub transaction_fee: u64,
    pub account_hash_state: String,
    pub token_hash_state: String,

    /// Block production stage, reported by the state endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl From<&BlockchainState> for StateView {
    fn from(state: &BlockchainState) -> Self {
        StateView {
            chain_id: state.chain_id,
            latest_block_number: state.latest_block_number,
            latest_hash: state.latest_hash.to_hex(),
            latest_token_id: state.latest_token_id.to_string(),
            transaction_fee: state.transaction_fee,
            account_hash_state: state.account_hash_state.to_hex(),
            token_hash_state: state.token_hash_state.to_hex(),
            stage: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AccountView {
    pub address: String,
    pub nonce: String,
    pub balance: u64,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        AccountView {
            address: account.address.to_string(),
            nonce: account.nonce.to_string(),
            balance: account.balance,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenView {
    pub id: String,
    pub owner: String,
    pub metadata_uri: String,
    pub nonce: String,
    pub burned: bool,
}

impl From<&Token> for TokenView {
    fn from(token: &Token) -> Self {
        TokenView {
            id: token.id.to_string(),
            owner: token.owner.to_string(),
            metadata_uri: token.metadata_uri.clone(),
            nonce: token.nonce.to_string(),
            burned: token.is_burned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MempoolEntryView {
    pub id: String,
    pub sequence: u64,
    pub transaction: TransactionView,
}

impl From<&MempoolTransaction> for MempoolEntryView {
    fn from(entry: &MempoolTransaction) -> Self {
        MempoolEntryView {
            id: entry.id.clone(),
            sequence: entry.sequence,
            transaction: TransactionView::from(&entry.signed),
        }
    }
}

/// Outcome of a submission: the new head, or the mempool entry id
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmissionResponse {
    /// `committed` or `queued`
    pub status: String,
    pub state: Option<StateView>,
    pub mempool_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub valid: bool,
    pub blocks_checked: usize,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    fn request_for(signed: &SignedTransaction) -> TransactionRequest {
        let view = TransactionView::from(signed);
        TransactionRequest {
            chain_id: Some(view.chain_id),
            kind: Some(view.kind),
            nonce: Some(view.nonce),
            from: Some(view.from),
            to: Some(view.to),
            value: Some(view.value),
            token_id: view.token_id,
            token_metadata_uri: view.token_metadata_uri,
            token_nonce: view.token_nonce,
            data: Some(view.data),
            signature: Some(view.signature),
        }
    }

    #[test]
    fn test_coin_request_parses_and_verifies() {
        let wallet = Wallet::new();
        let signed = Transaction::coin(3, 4u64, wallet.address(), Wallet::new().address(), 9)
            .sign(&wallet)
            .unwrap();

        let parsed = request_for(&signed).into_signed().unwrap();
        assert_eq!(parsed, signed);
        assert!(parsed.validate(3, true).is_ok());
    }

    #[test]
    fn test_token_request_parses() {
        let wallet = Wallet::new();
        let signed = Transaction::token(
            3,
            0u64,
            wallet.address(),
            wallet.address(),
            1,
            BigNum::from_u64(12),
            "ipfs://token/12",
            BigNum::zero(),
        )
        .sign(&wallet)
        .unwrap();

        let parsed = request_for(&signed).into_signed().unwrap();
        assert!(matches!(
            &parsed.transaction.kind,
            TransactionKind::Token { token_id, .. } if *token_id == BigNum::from_u64(12)
        ));
        assert!(parsed.validate(3, true).is_ok());
    }

    #[test]
    fn test_every_problem_is_reported() {
        let request = TransactionRequest {
            kind: Some("stake".to_string()),
            from: Some("0x1234".to_string()),
            value: Some(1),
            signature: Some("zz".to_string()),
            ..Default::default()
        };
        let errors = request.into_signed().unwrap_err();
        for field in ["chain_id", "nonce", "from", "to", "type", "signature"] {
            assert!(errors.contains_key(field), "missing error for {}", field);
        }
        assert!(!errors.contains_key("value"));
    }

    #[test]
    fn test_token_fields_required_for_token_type() {
        let request = TransactionRequest {
            chain_id: Some(1),
            kind: Some(TOKEN_TYPE.to_string()),
            nonce: Some("0".to_string()),
            from: Some(Address::ZERO.to_string()),
            to: Some(Address::ZERO.to_string()),
            value: Some(0),
            signature: Some(format!("0x{}", hex::encode([1u8; 65]))),
            ..Default::default()
        };
        let errors = request.into_signed().unwrap_err();
        assert!(errors.contains_key("token_id"));
        assert!(errors.contains_key("token_nonce"));
        assert!(errors.contains_key("token_metadata_uri"));
    }

    #[test]
    fn test_missing_and_unknown_fields_use_ledger_messages() {
        let request = TransactionRequest {
            kind: Some("stake".to_string()),
            ..Default::default()
        };
        let errors = request.into_signed().unwrap_err();
        assert_eq!(errors["nonce"], TransactionError::MissingField("nonce").to_string());
        assert_eq!(errors["type"], TransactionError::UnknownType("stake".to_string()).to_string());
    }

    #[test]
    fn test_payload_survives_parsing_and_keeps_signature_valid() {
        let wallet = Wallet::new();
        let mut tx = Transaction::coin(3, 0u64, wallet.address(), Wallet::new().address(), 2);
        tx.data = vec![0xca, 0xfe, 0x01];
        let signed = tx.sign(&wallet).unwrap();

        let mut request = request_for(&signed);
        assert_eq!(request.data.as_deref(), Some("0xcafe01"));
        let parsed = request.clone().into_signed().unwrap();
        assert_eq!(parsed.transaction.data, vec![0xca, 0xfe, 0x01]);
        assert!(parsed.validate(3, true).is_ok());

        // The prefix is optional
        request.data = Some("cafe01".to_string());
        assert_eq!(request.into_signed().unwrap(), signed);
    }

    #[test]
    fn test_bad_payload_is_reported() {
        let wallet = Wallet::new();
        let signed = Transaction::coin(3, 0u64, wallet.address(), Wallet::new().address(), 2)
            .sign(&wallet)
            .unwrap();
        let mut request = request_for(&signed);
        request.data = Some("0xnothex".to_string());
        let errors = request.into_signed().unwrap_err();
        assert!(errors.contains_key("data"));
    }

    #[test]
    fn test_unix_time_rendering() {
        assert_eq!(DateTimeUtc::from_unix(0).0.timestamp(), 0);
        assert_eq!(DateTimeUtc::from_unix(1_700_000_000).0.timestamp(), 1_700_000_000);
    }
}
