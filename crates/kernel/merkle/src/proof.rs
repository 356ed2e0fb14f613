use conclave_kernel_chain::Digest;
use conclave_types::EventId;
use serde::{Deserialize, Serialize};

use crate::tree::{verify, PathStep};

/// Everything needed to check one event against a published epoch root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub event_id: EventId,
    pub event_hash: Digest,
    pub merkle_path: Vec<PathStep>,
    pub merkle_root: Digest,
    pub epoch: u64,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        verify(&self.event_hash, &self.merkle_path, &self.merkle_root)
    }

    /// Check against a root obtained independently, e.g. from the
    /// `merkle.epoch.sealed` record.
    pub fn verify_against(&self, published_root: &Digest) -> bool {
        self.merkle_root == *published_root && self.verify()
    }
}
