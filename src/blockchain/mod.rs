// Blockchain module
//
// This module contains the ledger core:
// - Big integers, addresses, hashes and signing
// - Transactions, accounts and tokens
// - Blocks, Merkle trees and state hashing
// - Storage, mempool and head broadcast
// - Proof-of-authority block production and genesis

pub mod account;
pub mod bignum;
pub mod block;
pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod genesis;
pub mod lock;
pub mod mempool;
pub mod merkle;
pub mod pubsub;
pub mod state_hash;
pub mod storage;
pub mod transaction;
