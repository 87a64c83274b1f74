use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Prefix mixed into every signed digest so a ledger signature can never
/// be replayed as a signature for another protocol.
const SIGNATURE_STAMP: &[u8] = b"\x19PoA Ledger Signed Message:\n32";

/// Offset added to the secp256k1 recovery id to form `v`.
const RECOVERY_ID_OFFSET: u8 = 27;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Failed to recover signer: {0}")]
    RecoveryError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

fn decode_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::DecodingError(format!("expected {} bytes, got {}", N, b.len()))
    })
}

/// Serde plumbing shared by the fixed-width byte types: `0x` hex in
/// human-readable formats, raw bytes otherwise.
struct FixedBytesVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for FixedBytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes or a 0x-prefixed hex string", N)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<[u8; N], E> {
        decode_fixed_hex(v).map_err(E::custom)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<[u8; N], E> {
        v.try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))
    }
}

fn serialize_fixed<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    } else {
        serializer.serialize_bytes(bytes)
    }
}

fn deserialize_fixed<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    if deserializer.is_human_readable() {
        deserializer.deserialize_str(FixedBytesVisitor::<N>)
    } else {
        deserializer.deserialize_bytes(FixedBytesVisitor::<N>)
    }
}

/// Represents an account address (last 20 bytes of the Keccak-256 hash of
/// the uncompressed public key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address; burned tokens are owned by it.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Derives the address of a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let point = public_key.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Address(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex(s).map(Address)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_fixed(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_fixed(deserializer).map(Address)
    }
}

/// A 32-byte SHA-256 content hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Sentinel hash of the genesis block and of its (absent) parent.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hashes arbitrary bytes with SHA-256
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex(s).map(Hash)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_fixed(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_fixed(deserializer).map(Hash)
    }
}

/// Keccak-256 of arbitrary bytes
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Domain-separates a payload digest before it is signed or recovered.
pub fn stamp(digest: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(SIGNATURE_STAMP.len() + digest.len());
    data.extend_from_slice(SIGNATURE_STAMP);
    data.extend_from_slice(digest);
    keccak256(&data)
}

/// ECDSA signature components.
///
/// Kept as raw big-endian bytes so they persist without an
/// arbitrary-precision integer type. Empty vectors mean "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub v: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl Signature {
    /// True when every component carries at least one significant bit
    pub fn is_present(&self) -> bool {
        let significant = |b: &[u8]| b.iter().any(|x| *x != 0);
        significant(&self.v) && significant(&self.r) && significant(&self.s)
    }

    /// 65-byte `r || s || v` form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&left_pad::<32>(&self.r));
        out.extend_from_slice(&left_pad::<32>(&self.s));
        out.push(self.v.last().copied().unwrap_or_default());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 65 {
            return Err(CryptoError::InvalidSignature(format!(
                "expected 65 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Signature {
            r: bytes[..32].to_vec(),
            s: bytes[32..64].to_vec(),
            v: vec![bytes[64]],
        })
    }

    fn to_ecdsa(&self) -> Result<(EcdsaSignature, RecoveryId), CryptoError> {
        if !self.is_present() {
            return Err(CryptoError::InvalidSignature("missing v, r or s".to_string()));
        }
        if self.r.len() > 32 || self.s.len() > 32 {
            return Err(CryptoError::InvalidSignature("r or s longer than 32 bytes".to_string()));
        }

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&left_pad::<32>(&self.r));
        rs[32..].copy_from_slice(&left_pad::<32>(&self.s));
        let signature = EcdsaSignature::from_slice(&rs)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let v = self.v.last().copied().unwrap_or_default();
        let recovery_id = v
            .checked_sub(RECOVERY_ID_OFFSET)
            .and_then(RecoveryId::from_byte)
            .ok_or_else(|| CryptoError::InvalidSignature(format!("invalid recovery value {}", v)))?;

        Ok((signature, recovery_id))
    }
}

fn left_pad<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let take = bytes.len().min(N);
    out[N - take..].copy_from_slice(&bytes[bytes.len() - take..]);
    out
}

/// Recovers the public key that produced `signature` over the stamped digest
pub fn recover_public_key(digest: &[u8; 32], signature: &Signature) -> Result<VerifyingKey, CryptoError> {
    let (signature, recovery_id) = signature.to_ecdsa()?;
    VerifyingKey::recover_from_prehash(&stamp(digest), &signature, recovery_id)
        .map_err(|e| CryptoError::RecoveryError(e.to_string()))
}

/// Recovers the signer address of `signature` over the stamped digest
pub fn recover_address(digest: &[u8; 32], signature: &Signature) -> Result<Address, CryptoError> {
    recover_public_key(digest, signature).map(|key| Address::from_public_key(&key))
}

/// Represents a wallet with a secp256k1 keypair
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet").field("address", &self.address).finish()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Creates a wallet from a hex encoded secret key (with or without `0x`)
    pub fn from_hex(secret_key_hex: &str) -> Result<Self, CryptoError> {
        let digits = secret_key_hex.trim().strip_prefix("0x").unwrap_or(secret_key_hex.trim());
        let bytes = hex::decode(digits).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        Self::from_secret_key(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = Address::from_public_key(&verifying_key);
        Wallet {
            signing_key,
            verifying_key,
            address,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Compressed SEC1 public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Signs the stamped form of a payload digest
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&stamp(digest))
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;

        let bytes = signature.to_bytes();
        Ok(Signature {
            v: vec![recovery_id.to_byte() + RECOVERY_ID_OFFSET],
            r: bytes[..32].to_vec(),
            s: bytes[32..].to_vec(),
        })
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses compressed or uncompressed SEC1 public key bytes
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(!wallet.address().is_zero());
        assert_eq!(wallet.public_key_bytes().len(), 33);
    }

    #[test]
    fn test_sign_and_recover() {
        let wallet = Wallet::new();
        let digest = keccak256(b"Hello, world!");

        let signature = wallet.sign_digest(&digest).unwrap();
        assert!(signature.is_present());
        assert_eq!(recover_address(&digest, &signature).unwrap(), wallet.address());

        // A different payload recovers a different signer
        let other = keccak256(b"Wrong message");
        let recovered = recover_address(&other, &signature);
        assert!(recovered.map(|a| a != wallet.address()).unwrap_or(true));
    }

    #[test]
    fn test_stamp_changes_digest() {
        let digest = keccak256(b"payload");
        assert_ne!(stamp(&digest), digest);
    }

    #[test]
    fn test_wallet_roundtrip_from_hex() {
        let wallet = Wallet::new();
        let restored = Wallet::from_hex(&hex::encode(wallet.export_secret_key())).unwrap();
        assert_eq!(restored.address(), wallet.address());
    }

    #[test]
    fn test_signature_bytes_roundtrip() {
        let wallet = Wallet::new();
        let digest = keccak256(b"header");
        let signature = wallet.sign_digest(&digest).unwrap();

        let restored = Signature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(recover_address(&digest, &restored).unwrap(), wallet.address());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let digest = keccak256(b"payload");
        assert!(recover_address(&digest, &Signature::default()).is_err());
    }

    #[test]
    fn test_address_display_and_parse() {
        let wallet = Wallet::new();
        let text = wallet.address().to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 42);
        assert_eq!(Address::from_str(&text).unwrap(), wallet.address());
        assert!(Address::from_str("0x1234").is_err());
    }

    #[test]
    fn test_hash_json_is_hex() {
        let hash = Hash::digest(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
