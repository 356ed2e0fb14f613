use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use conclave_kernel_chain::{Digest, Envelope};
use conclave_types::{EventId, EventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MerkleError;
use crate::proof::InclusionProof;
use crate::tree::MerkleTree;

/// When an epoch closes.
///
/// Both rules only look at envelopes (sequence count or envelope
/// timestamps), so the epochs of a ledger are a function of the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochBoundary {
    /// Every `n` consecutive sequences.
    Count(u64),
    /// An epoch opened by an envelope at `t` takes every envelope stamped
    /// before `t + window`.
    Window(Duration),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleConfig {
    pub epoch_size: u64,
    /// When set, epochs are time windows of this many seconds instead.
    pub epoch_window_secs: Option<u64>,
    pub seal_check_interval_ms: u64,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            epoch_size: 256,
            epoch_window_secs: None,
            seal_check_interval_ms: 1000,
        }
    }
}

impl MerkleConfig {
    /// Epoch records are themselves ledger entries, so a count epoch holds
    /// at least two.
    pub fn boundary(&self) -> EpochBoundary {
        match self.epoch_window_secs {
            Some(secs) => EpochBoundary::Window(Duration::seconds(secs.max(1) as i64)),
            None => EpochBoundary::Count(self.epoch_size.max(2)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochLeaf {
    pub event_id: EventId,
    pub sequence: u64,
    pub event_hash: Digest,
}

/// Payload of `merkle.epoch.sealed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealRecord {
    pub epoch: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub leaf_count: u64,
    pub root: Digest,
}

/// A closed epoch. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedEpoch {
    pub epoch: u64,
    pub opened_at: DateTime<Utc>,
    leaves: Vec<EpochLeaf>,
    tree: MerkleTree,
}

impl SealedEpoch {
    pub fn root(&self) -> Digest {
        self.tree.root()
    }

    pub fn leaves(&self) -> &[EpochLeaf] {
        &self.leaves
    }

    pub fn first_sequence(&self) -> u64 {
        self.leaves[0].sequence
    }

    pub fn last_sequence(&self) -> u64 {
        self.leaves[self.leaves.len() - 1].sequence
    }

    pub fn record(&self) -> SealRecord {
        SealRecord {
            epoch: self.epoch,
            first_sequence: self.first_sequence(),
            last_sequence: self.last_sequence(),
            leaf_count: self.leaves.len() as u64,
            root: self.root(),
        }
    }

    fn proof(&self, position: usize) -> Option<InclusionProof> {
        let leaf = self.leaves.get(position)?;
        Some(InclusionProof {
            event_id: leaf.event_id,
            event_hash: leaf.event_hash,
            merkle_path: self.tree.path(position)?,
            merkle_root: self.root(),
            epoch: self.epoch,
        })
    }
}

/// Groups the ledger into epochs and builds a tree per closed epoch.
#[derive(Debug)]
pub struct MerkleAccumulator {
    boundary: EpochBoundary,
    next_sequence: u64,
    pending: Vec<EpochLeaf>,
    pending_opened_at: Option<DateTime<Utc>>,
    pending_records_only: bool,
    sealed: Vec<SealedEpoch>,
    locations: HashMap<EventId, (u64, usize)>,
}

impl MerkleAccumulator {
    pub fn new(boundary: EpochBoundary) -> Self {
        Self {
            boundary,
            next_sequence: 0,
            pending: Vec::new(),
            pending_opened_at: None,
            pending_records_only: true,
            sealed: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn boundary(&self) -> EpochBoundary {
        self.boundary
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn epochs(&self) -> &[SealedEpoch] {
        &self.sealed
    }

    pub fn epoch(&self, epoch: u64) -> Option<&SealedEpoch> {
        self.sealed.get(epoch as usize)
    }

    fn open_epoch(&self) -> u64 {
        self.sealed.len() as u64
    }

    /// Add the next envelope. Returns the number of an epoch this closed.
    /// Envelopes below the accumulator's position are ignored.
    pub fn ingest(&mut self, envelope: &Envelope) -> Result<Option<u64>, MerkleError> {
        if envelope.sequence < self.next_sequence {
            return Ok(None);
        }
        if envelope.sequence > self.next_sequence {
            return Err(MerkleError::OutOfOrder {
                expected: self.next_sequence,
                found: envelope.sequence,
            });
        }

        let mut closed = None;
        if let (EpochBoundary::Window(window), Some(opened)) = (self.boundary, self.pending_opened_at) {
            if envelope.timestamp >= opened + window {
                closed = self.seal();
            }
        }

        let epoch = self.open_epoch();
        self.locations
            .insert(envelope.event_id, (epoch, self.pending.len()));
        self.pending.push(EpochLeaf {
            event_id: envelope.event_id,
            sequence: envelope.sequence,
            event_hash: envelope.hash,
        });
        self.pending_opened_at.get_or_insert(envelope.timestamp);
        if !matches!(envelope.kind(), Ok(EventKind::MerkleEpochSealed)) {
            self.pending_records_only = false;
        }
        self.next_sequence += 1;

        if let EpochBoundary::Count(size) = self.boundary {
            if self.pending.len() as u64 >= size {
                closed = self.seal();
            }
        }
        Ok(closed)
    }

    /// Close a window epoch whose window has passed by `now`. Envelopes
    /// appended later are stamped at or after `now`, so this closes the
    /// epoch exactly where the next envelope would have. An epoch holding
    /// only epoch records is left open.
    pub fn seal_pending(&mut self, now: DateTime<Utc>) -> Option<u64> {
        let EpochBoundary::Window(window) = self.boundary else {
            return None;
        };
        let opened = self.pending_opened_at?;
        if self.pending_records_only || now < opened + window {
            return None;
        }
        self.seal()
    }

    fn seal(&mut self) -> Option<u64> {
        let opened_at = self.pending_opened_at.take()?;
        let leaves = std::mem::take(&mut self.pending);
        let hashes: Vec<Digest> = leaves.iter().map(|l| l.event_hash).collect();
        let tree = MerkleTree::build(&hashes)?;
        let epoch = self.open_epoch();
        self.pending_records_only = true;
        debug!(
            epoch,
            leaves = leaves.len(),
            root = %tree.root(),
            "Merkle epoch sealed"
        );
        self.sealed.push(SealedEpoch {
            epoch,
            opened_at,
            leaves,
            tree,
        });
        Some(epoch)
    }

    pub fn prove(&self, event_id: &EventId) -> Result<InclusionProof, MerkleError> {
        let &(epoch, position) = self
            .locations
            .get(event_id)
            .ok_or(MerkleError::UnknownEvent(*event_id))?;
        self.epoch(epoch)
            .and_then(|sealed| sealed.proof(position))
            .ok_or(MerkleError::NotYetSealed {
                event_id: *event_id,
                epoch,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use conclave_kernel_chain::{link, Candidate, ChainTail, EnvelopeDraft, HashAlgorithm};
    use conclave_types::{ActorId, LedgerVerb};
    use serde_json::json;

    fn chain(n: usize, spacing: Duration) -> Vec<Envelope> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut tail = ChainTail::genesis();
        (0..n)
            .map(|i| {
                let draft = EnvelopeDraft::new(
                    EventKind::Ledger(LedgerVerb::IntegrityViolated),
                    ActorId::ledger_custodian(),
                    json!({ "i": i }),
                );
                let env = link(
                    &tail,
                    Candidate {
                        draft,
                        event_id: EventId::new(),
                        timestamp: start + spacing * i as i32,
                    },
                    HashAlgorithm::Blake3,
                )
                .unwrap();
                tail = ChainTail::after(&env);
                env
            })
            .collect()
    }

    #[test]
    fn count_epochs_close_every_n() {
        let envs = chain(10, Duration::seconds(1));
        let mut acc = MerkleAccumulator::new(EpochBoundary::Count(4));
        let closed: Vec<_> = envs.iter().filter_map(|e| acc.ingest(e).unwrap()).collect();
        assert_eq!(closed, vec![0, 1]);
        assert_eq!(acc.epoch(1).unwrap().first_sequence(), 4);
        assert_eq!(acc.epoch(1).unwrap().last_sequence(), 7);
        assert_eq!(acc.pending_len(), 2);

        let proof = acc.prove(&envs[5].event_id).unwrap();
        assert!(proof.verify_against(&acc.epoch(1).unwrap().root()));
        assert!(matches!(
            acc.prove(&envs[9].event_id),
            Err(MerkleError::NotYetSealed { epoch: 2, .. })
        ));
        assert!(matches!(
            acc.prove(&EventId::new()),
            Err(MerkleError::UnknownEvent(_))
        ));
    }

    #[test]
    fn window_epochs_follow_timestamps() {
        let envs = chain(6, Duration::seconds(25));
        let mut acc = MerkleAccumulator::new(EpochBoundary::Window(Duration::seconds(60)));
        let closed: Vec<_> = envs.iter().filter_map(|e| acc.ingest(e).unwrap()).collect();
        // 0s, 25s, 50s | 75s, 100s, 125s
        assert_eq!(closed, vec![0]);
        assert_eq!(acc.epoch(0).unwrap().leaves().len(), 3);

        let later = envs[3].timestamp + Duration::seconds(61);
        assert_eq!(acc.seal_pending(later), Some(1));
        assert_eq!(acc.seal_pending(later), None);
    }

    #[test]
    fn replays_are_ignored_and_gaps_refused() {
        let envs = chain(3, Duration::seconds(1));
        let mut acc = MerkleAccumulator::new(EpochBoundary::Count(8));
        acc.ingest(&envs[0]).unwrap();
        acc.ingest(&envs[0]).unwrap();
        assert_eq!(acc.next_sequence(), 1);
        assert!(matches!(
            acc.ingest(&envs[2]),
            Err(MerkleError::OutOfOrder { expected: 1, found: 2 })
        ));
    }
}
