use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};

use super::bignum::BigNum;
use super::crypto::{keccak256, public_key_from_bytes, recover_public_key, Address, CryptoError, Hash, Signature, Wallet};
use super::merkle::{MerkleError, MerkleTree};
use super::transaction::SignedTransaction;

/// Block numbers advance by this much per accepted block
pub const BLOCK_STRIDE: u64 = 2;

/// A candidate this far (or further) ahead of its parent means the caller
/// is on a fork and must resynchronise
pub const FORK_DISTANCE: u64 = 2 * BLOCK_STRIDE;

/// How many nonces are tried between cancellation checks while sealing
const SEAL_CHECK_INTERVAL: u64 = 1024;

/// Errors that can occur while building or validating blocks
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Block {candidate} is too far ahead of {previous}: chain is forked, resync required")]
    Forked { previous: u64, candidate: u64 },

    #[error("Difficulty decreased: parent {parent}, candidate {candidate}")]
    DifficultyDecreased { parent: u16, candidate: u16 },

    #[error("Block hash {hash} does not satisfy difficulty {difficulty}")]
    NotSealed { hash: Hash, difficulty: u16 },

    #[error("Block number out of sequence: expected {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },

    #[error("Parent hash mismatch: expected {expected}, got {got}")]
    ParentMismatch { expected: Hash, got: Hash },

    #[error("Timestamp {candidate} precedes parent timestamp {parent}")]
    TimestampRegressed { parent: u64, candidate: u64 },

    #[error("State root mismatch: expected {expected}, got {got}")]
    StateRootMismatch { expected: Hash, got: Hash },

    #[error("Transaction root mismatch: expected {expected}, got {got}")]
    TransRootMismatch { expected: Hash, got: Hash },

    #[error("Block signature not produced by validator {0}")]
    SignatureMismatch(String),

    #[error("Sealing cancelled")]
    SealCancelled,

    #[error("Nonce space exhausted while sealing")]
    SealExhausted,

    #[error("Merkle error: {0}")]
    MerkleError(#[from] MerkleError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

impl BlockError {
    /// The candidate belongs to another branch; linear extension is pointless
    pub fn requires_resync(&self) -> bool {
        matches!(self, BlockError::Forked { .. })
    }
}

/// Checks the proof condition: the `0x`-prefixed hex form of `hash` must
/// begin with `difficulty + 2` characters equal to `0x` followed by zeros.
pub fn meets_difficulty(hash: &Hash, difficulty: u16) -> bool {
    let run = difficulty as usize + 2;
    let text = hash.to_hex();
    if text.len() < run {
        return false;
    }
    let target = format!("0x{}", "0".repeat(difficulty as usize));
    text[..run] == target
}

/// Represents a block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: u16,

    pub number: u64,

    pub prev_block_hash: Hash,

    /// Unix seconds
    pub timestamp: u64,

    /// Leading zero hex digits the header hash must carry
    pub difficulty: u16,

    pub beneficiary: Address,

    pub transaction_fee: u64,

    /// Hash over every funded account
    pub state_root: Hash,

    /// Merkle root of the block's transactions
    pub trans_root: Hash,

    /// Proof nonce found while sealing
    pub nonce: u64,

    pub latest_token_id: BigNum,

    /// Hash over every token
    pub tokens_root: Hash,
}

impl BlockHeader {
    fn encode(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::EncodingError(e.to_string()))
    }

    /// SHA-256 of the canonical header encoding
    pub fn content_hash(&self) -> Result<Hash, BlockError> {
        Ok(Hash::digest(&self.encode()?))
    }

    /// Digest the validator signs
    pub fn signing_digest(&self) -> Result<[u8; 32], BlockError> {
        Ok(keccak256(&self.encode()?))
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Searches for a nonce whose header hash meets the difficulty.
    ///
    /// Checks `cancel` every few thousand attempts and gives up with
    /// `SealCancelled` once it is set.
    pub fn seal(&mut self, cancel: &AtomicBool) -> Result<Hash, BlockError> {
        let mut attempts: u64 = 0;
        loop {
            let hash = self.content_hash()?;
            if meets_difficulty(&hash, self.difficulty) {
                return Ok(hash);
            }

            attempts += 1;
            if attempts % SEAL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(BlockError::SealCancelled);
            }

            self.nonce = self.nonce.checked_add(1).ok_or(BlockError::SealExhausted)?;
        }
    }
}

/// The authority identity that signs block headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: String,

    /// Compressed SEC1 public key
    pub public_key: Vec<u8>,
}

impl Validator {
    pub fn from_wallet(id: impl Into<String>, wallet: &Wallet) -> Self {
        Validator {
            id: id.into(),
            public_key: wallet.public_key_bytes(),
        }
    }

    pub fn address(&self) -> Result<Address, CryptoError> {
        public_key_from_bytes(&self.public_key).map(|key| Address::from_public_key(&key))
    }
}

/// Represents a block in the chain
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,

    pub header_signature: Signature,

    pub merkle_tree: MerkleTree<SignedTransaction>,

    pub validator: Validator,
}

impl Block {
    /// Signs a sealed header and assembles the block
    pub fn sign(
        header: BlockHeader,
        merkle_tree: MerkleTree<SignedTransaction>,
        wallet: &Wallet,
        validator: Validator,
    ) -> Result<Self, BlockError> {
        let header_signature = wallet.sign_digest(&header.signing_digest()?)?;
        Ok(Block {
            header,
            header_signature,
            merkle_tree,
            validator,
        })
    }

    /// Hash of the header alone; the genesis block hashes to `Hash::ZERO`
    pub fn hash(&self) -> Result<Hash, BlockError> {
        if self.header.is_genesis() {
            return Ok(Hash::ZERO);
        }
        self.header.content_hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn transactions(&self) -> &[SignedTransaction] {
        self.merkle_tree.values()
    }

    /// Checks that this block may extend `previous`.
    ///
    /// Rules run in a fixed order and the first failure is returned.
    pub fn validate_block(&self, previous: &Block, expected_state_root: &Hash) -> Result<(), BlockError> {
        let candidate = &self.header;
        let parent = &previous.header;

        if candidate.number >= parent.number.saturating_add(FORK_DISTANCE) {
            return Err(BlockError::Forked {
                previous: parent.number,
                candidate: candidate.number,
            });
        }

        if candidate.difficulty < parent.difficulty {
            return Err(BlockError::DifficultyDecreased {
                parent: parent.difficulty,
                candidate: candidate.difficulty,
            });
        }

        let hash = self.hash()?;
        if !meets_difficulty(&hash, candidate.difficulty) {
            return Err(BlockError::NotSealed {
                hash,
                difficulty: candidate.difficulty,
            });
        }

        let expected_number = parent.number.saturating_add(BLOCK_STRIDE);
        if candidate.number != expected_number {
            return Err(BlockError::OutOfSequence {
                expected: expected_number,
                got: candidate.number,
            });
        }

        let parent_hash = previous.hash()?;
        if candidate.prev_block_hash != parent_hash {
            return Err(BlockError::ParentMismatch {
                expected: parent_hash,
                got: candidate.prev_block_hash,
            });
        }

        if parent.timestamp > 0 && candidate.timestamp < parent.timestamp {
            return Err(BlockError::TimestampRegressed {
                parent: parent.timestamp,
                candidate: candidate.timestamp,
            });
        }

        if candidate.state_root != *expected_state_root {
            return Err(BlockError::StateRootMismatch {
                expected: *expected_state_root,
                got: candidate.state_root,
            });
        }

        let trans_root = self.merkle_tree.root();
        if candidate.trans_root != trans_root {
            return Err(BlockError::TransRootMismatch {
                expected: trans_root,
                got: candidate.trans_root,
            });
        }

        Ok(())
    }

    /// Checks that the header signature was produced by the block's validator
    pub fn verify_signature(&self) -> Result<(), BlockError> {
        let signer = recover_public_key(&self.header.signing_digest()?, &self.header_signature)?;
        let expected = public_key_from_bytes(&self.validator.public_key)?;
        if signer != expected {
            return Err(BlockError::SignatureMismatch(self.validator.id.clone()));
        }
        Ok(())
    }
}

/// The persisted projection of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: Hash,

    pub header: BlockHeader,

    pub header_signature: Signature,

    pub transactions: Vec<SignedTransaction>,

    pub validator: Validator,
}

impl BlockData {
    pub fn new(block: &Block) -> Result<Self, BlockError> {
        Ok(BlockData {
            hash: block.hash()?,
            header: block.header.clone(),
            header_signature: block.header_signature.clone(),
            transactions: block.transactions().to_vec(),
            validator: block.validator.clone(),
        })
    }

    /// Rebuilds the block, reconstructing its Merkle tree
    pub fn to_block(&self) -> Result<Block, BlockError> {
        let merkle_tree = MerkleTree::new(self.transactions.clone())?;
        Ok(Block {
            header: self.header.clone(),
            header_signature: self.header_signature.clone(),
            merkle_tree,
            validator: self.validator.clone(),
        })
    }
}

/// The chain head pointer, replaced atomically after every block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainState {
    pub chain_id: u16,

    pub latest_block_number: u64,

    pub latest_hash: Hash,

    pub latest_token_id: BigNum,

    pub transaction_fee: u64,

    pub account_hash_state: Hash,

    pub token_hash_state: Hash,
}

impl BlockchainState {
    /// The head that results from appending `block`
    pub fn from_block(block: &Block) -> Result<Self, BlockError> {
        Ok(BlockchainState {
            chain_id: block.header.chain_id,
            latest_block_number: block.header.number,
            latest_hash: block.hash()?,
            latest_token_id: block.header.latest_token_id.clone(),
            transaction_fee: block.header.transaction_fee,
            account_hash_state: block.header.state_root,
            token_hash_state: block.header.tokens_root,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;

    pub(crate) const CHAIN: u16 = 1;

    fn signed_transfer(wallet: &Wallet, nonce: u64) -> SignedTransaction {
        Transaction::coin(CHAIN, nonce, wallet.address(), Wallet::new().address(), 10)
            .sign(wallet)
            .unwrap()
    }

    pub(crate) fn header(number: u64, prev: Hash, difficulty: u16, trans_root: Hash) -> BlockHeader {
        BlockHeader {
            chain_id: CHAIN,
            number,
            prev_block_hash: prev,
            timestamp: 1_000 + number,
            difficulty,
            beneficiary: Address::ZERO,
            transaction_fee: 1,
            state_root: Hash::digest(b"state"),
            trans_root,
            nonce: 0,
            latest_token_id: BigNum::zero(),
            tokens_root: Hash::digest(b"tokens"),
        }
    }

    /// Builds a sealed, signed block extending `prev_hash`
    pub(crate) fn sealed_block(wallet: &Wallet, number: u64, prev_hash: Hash, difficulty: u16) -> Block {
        let tree = MerkleTree::new(vec![signed_transfer(wallet, number)]).unwrap();
        let mut header = header(number, prev_hash, difficulty, tree.root());
        header.seal(&AtomicBool::new(false)).unwrap();
        Block::sign(header, tree, wallet, Validator::from_wallet("authority", wallet)).unwrap()
    }

    #[test]
    fn test_difficulty_predicate() {
        let mut bytes = [0xffu8; 32];
        bytes[0] = 0x00;
        bytes[1] = 0x0f;
        let hash = Hash(bytes);
        assert!(meets_difficulty(&hash, 0));
        assert!(meets_difficulty(&hash, 2));
        assert!(meets_difficulty(&hash, 3));
        assert!(!meets_difficulty(&hash, 4));
        assert!(meets_difficulty(&Hash::ZERO, 64));
    }

    #[test]
    fn test_genesis_hashes_to_zero() {
        let wallet = Wallet::new();
        let genesis = sealed_block(&wallet, 0, Hash::ZERO, 1);
        assert_eq!(genesis.hash().unwrap(), Hash::ZERO);

        let next = sealed_block(&wallet, 2, Hash::ZERO, 1);
        assert_eq!(next.hash().unwrap(), next.header.content_hash().unwrap());
    }

    #[test]
    fn test_hash_covers_header_only() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let mut data = BlockData::new(&block).unwrap();
        data.transactions.push(signed_transfer(&wallet, 99));
        let rebuilt = data.to_block().unwrap();
        assert_eq!(rebuilt.hash().unwrap(), block.hash().unwrap());
    }

    #[test]
    fn test_valid_successor_accepted() {
        let wallet = Wallet::new();
        let genesis = sealed_block(&wallet, 0, Hash::ZERO, 1);
        let next = sealed_block(&wallet, 2, genesis.hash().unwrap(), 1);

        let state_root = next.header.state_root;
        assert!(next.validate_block(&genesis, &state_root).is_ok());
        assert!(next.verify_signature().is_ok());
    }

    #[test]
    fn test_fork_detected_first() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 2);
        // Lower difficulty too, but the fork rule fires first
        let candidate = sealed_block(&wallet, 6, Hash::ZERO, 1);

        let err = candidate.validate_block(&parent, &candidate.header.state_root).unwrap_err();
        assert!(matches!(err, BlockError::Forked { previous: 2, candidate: 6 }));
        assert!(err.requires_resync());

        let far = sealed_block(&wallet, 40, Hash::ZERO, 2);
        assert!(matches!(
            far.validate_block(&parent, &far.header.state_root),
            Err(BlockError::Forked { .. })
        ));
    }

    #[test]
    fn test_lower_difficulty_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 2);
        let candidate = sealed_block(&wallet, 4, parent.hash().unwrap(), 1);
        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::DifficultyDecreased { .. })
        ));
    }

    #[test]
    fn test_unsealed_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let mut candidate = sealed_block(&wallet, 4, parent.hash().unwrap(), 1);
        // Raise the difficulty well past what the found nonce satisfies
        candidate.header.difficulty = 12;
        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::NotSealed { .. })
        ));
    }

    #[test]
    fn test_stride_of_one_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let candidate = sealed_block(&wallet, 3, parent.hash().unwrap(), 1);
        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::OutOfSequence { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_parent_mismatch_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let candidate = sealed_block(&wallet, 4, Hash::digest(b"elsewhere"), 1);
        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn test_timestamp_regression_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let tree = MerkleTree::new(vec![signed_transfer(&wallet, 1)]).unwrap();
        let mut h = header(4, parent.hash().unwrap(), 1, tree.root());
        h.timestamp = parent.header.timestamp - 1;
        h.seal(&AtomicBool::new(false)).unwrap();
        let candidate = Block::sign(h, tree, &wallet, Validator::from_wallet("authority", &wallet)).unwrap();

        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::TimestampRegressed { .. })
        ));
    }

    #[test]
    fn test_state_root_mismatch_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let candidate = sealed_block(&wallet, 4, parent.hash().unwrap(), 1);
        assert!(matches!(
            candidate.validate_block(&parent, &Hash::digest(b"other state")),
            Err(BlockError::StateRootMismatch { .. })
        ));
    }

    #[test]
    fn test_trans_root_mismatch_rejected() {
        let wallet = Wallet::new();
        let parent = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let tree = MerkleTree::new(vec![signed_transfer(&wallet, 1)]).unwrap();
        let mut h = header(4, parent.hash().unwrap(), 1, Hash::digest(b"wrong root"));
        h.seal(&AtomicBool::new(false)).unwrap();
        let candidate = Block::sign(h, tree, &wallet, Validator::from_wallet("authority", &wallet)).unwrap();

        assert!(matches!(
            candidate.validate_block(&parent, &candidate.header.state_root),
            Err(BlockError::TransRootMismatch { .. })
        ));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let wallet = Wallet::new();
        let mut block = sealed_block(&wallet, 2, Hash::ZERO, 1);
        block.validator = Validator::from_wallet("impostor", &Wallet::new());
        assert!(matches!(block.verify_signature(), Err(BlockError::SignatureMismatch(_))));
    }

    #[test]
    fn test_block_data_round_trip() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let data = BlockData::new(&block).unwrap();

        let stored = bincode::serialize(&data).unwrap();
        let restored: BlockData = bincode::deserialize(&stored).unwrap();
        let rebuilt = restored.to_block().unwrap();

        assert_eq!(rebuilt.header, block.header);
        assert_eq!(rebuilt.header_signature, block.header_signature);
        assert_eq!(rebuilt.validator, block.validator);
        assert_eq!(rebuilt.transactions(), block.transactions());
        assert_eq!(rebuilt.merkle_tree.root(), block.merkle_tree.root());
    }

    #[test]
    fn test_to_block_without_transactions_fails() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet, 2, Hash::ZERO, 1);
        let mut data = BlockData::new(&block).unwrap();
        data.transactions.clear();
        assert!(matches!(data.to_block(), Err(BlockError::MerkleError(MerkleError::Empty))));
    }

    #[test]
    fn test_seal_cancellation() {
        let wallet = Wallet::new();
        let tree = MerkleTree::new(vec![signed_transfer(&wallet, 0)]).unwrap();
        let mut h = header(2, Hash::ZERO, 64, tree.root());
        let cancel = AtomicBool::new(true);
        assert!(matches!(h.seal(&cancel), Err(BlockError::SealCancelled)));
    }
}
