//! Merkle tree over an ordered list of values.
//!
//! - Construction fails on an empty list.
//! - Odd layers are padded by duplicating the last node.
//! - Leaves and inner nodes are hashed with distinct prefixes.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::crypto::Hash;
use super::transaction::SignedTransaction;

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

/// Errors that can occur while building a tree
#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("Cannot build a Merkle tree without values")]
    Empty,

    #[error("Failed to hash leaf {index}: {reason}")]
    LeafHash { index: usize, reason: String },
}

/// Anything that can sit in a leaf
pub trait MerkleLeaf {
    fn leaf_hash(&self) -> Result<Hash, String>;
}

impl MerkleLeaf for SignedTransaction {
    fn leaf_hash(&self) -> Result<Hash, String> {
        self.hash().map_err(|e| e.to_string())
    }
}

/// Deterministic Merkle tree keeping the original values in order
#[derive(Debug, Clone)]
pub struct MerkleTree<T> {
    values: Vec<T>,
    root: Hash,
}

impl<T: MerkleLeaf> MerkleTree<T> {
    /// Builds a tree from an ordered, non-empty sequence of values
    pub fn new(values: Vec<T>) -> Result<Self, MerkleError> {
        if values.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut nodes = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let leaf = value
                .leaf_hash()
                .map_err(|reason| MerkleError::LeafHash { index, reason })?;
            nodes.push(hash_with_prefix(LEAF_PREFIX, &[leaf.as_bytes()]));
        }

        Ok(MerkleTree {
            root: reduce(nodes),
            values,
        })
    }
}

impl<T> MerkleTree<T> {
    pub fn root(&self) -> Hash {
        self.root
    }

    /// The original values, in insertion order
    pub fn values(&self) -> &[T] {
        &self.values
    }
}

fn hash_with_prefix(prefix: &[u8], parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

/// In-place pairwise reduction down to the root
fn reduce(mut nodes: Vec<Hash>) -> Hash {
    let mut len = nodes.len();

    while len > 1 {
        let mut write = 0;
        let mut read = 0;

        while read < len {
            let left = nodes[read];
            let right = if read + 1 < len { nodes[read + 1] } else { left };

            nodes[write] = hash_with_prefix(NODE_PREFIX, &[left.as_bytes(), right.as_bytes()]);

            write += 1;
            read += 2;
        }

        len = write;
    }

    nodes[0]
}
