use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

/// Why a single link failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakReason {
    #[error("prev_hash {found} does not match predecessor hash {expected}")]
    PrevHashMismatch { expected: Digest, found: Digest },

    #[error("stored hash {stored} does not match recomputed {computed}")]
    HashMismatch { computed: Digest, stored: Digest },

    #[error("expected sequence {expected}, found {found}")]
    SequenceOutOfOrder { expected: u64, found: u64 },

    #[error("envelope could not be canonicalized: {detail}")]
    Unhashable { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("hash chain break at sequence {sequence}: {reason}")]
    HashBreakAt { sequence: u64, reason: BreakReason },

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed digest: {0}")]
    MalformedDigest(String),

    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
}

impl ChainError {
    /// Sequence of the first offending envelope, for chain breaks.
    pub fn break_sequence(&self) -> Option<u64> {
        match self {
            ChainError::HashBreakAt { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}
