//! Event envelope and hash chain.
//!
//! Every ledger record is an [`Envelope`] whose `hash` covers the canonical
//! JSON of all its other fields, including `prev_hash`. The first envelope
//! links to [`Digest::GENESIS_SENTINEL`]. Digests carry their algorithm
//! (`blake3:<hex>` or `sha256:<hex>`) so verification never has to guess.

pub mod canonical;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod verify;

pub use canonical::{canonical_bytes, canonicalize};
pub use digest::{Digest, HashAlgorithm};
pub use envelope::{Candidate, Envelope, EnvelopeDraft, CURRENT_SCHEMA_VERSION};
pub use error::{BreakReason, ChainError};
pub use verify::{link, verify_chain, verify_link, ChainSummary, ChainTail, ChainVerifier};
