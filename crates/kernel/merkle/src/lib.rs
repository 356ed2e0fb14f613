//! Merkle accumulator.
//!
//! The ledger is cut into epochs ([`EpochBoundary`]); each closed epoch gets
//! a binary Merkle tree over its envelope hashes and its root is recorded in
//! the ledger as `merkle.epoch.sealed`. An [`InclusionProof`] can be checked
//! with [`verify`] against that root alone.

pub mod accumulator;
pub mod error;
pub mod proof;
pub mod service;
pub mod tree;

pub use accumulator::{
    EpochBoundary, EpochLeaf, MerkleAccumulator, MerkleConfig, SealRecord, SealedEpoch,
};
pub use error::MerkleError;
pub use proof::InclusionProof;
pub use service::MerkleService;
pub use tree::{leaf_hash, node_hash, verify, MerkleTree, PathStep, Side};
