use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, HashAlgorithm};
use crate::envelope::{Candidate, Envelope};
use crate::error::{BreakReason, ChainError};

/// The end of a chain: what the next envelope has to link to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTail {
    pub next_sequence: u64,
    pub hash: Digest,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChainTail {
    pub fn genesis() -> Self {
        Self {
            next_sequence: 0,
            hash: Digest::GENESIS_SENTINEL,
            timestamp: None,
        }
    }

    pub fn after(envelope: &Envelope) -> Self {
        Self {
            next_sequence: envelope.sequence + 1,
            hash: envelope.hash,
            timestamp: Some(envelope.timestamp),
        }
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.next_sequence.checked_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence == 0
    }
}

impl Default for ChainTail {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Link a candidate onto `tail`, producing a sealed envelope.
pub fn link(
    tail: &ChainTail,
    candidate: Candidate,
    algorithm: HashAlgorithm,
) -> Result<Envelope, ChainError> {
    let Candidate {
        draft,
        event_id,
        timestamp,
    } = candidate;
    let mut envelope = Envelope {
        event_id,
        event_type: draft.event_type,
        schema_version: draft.schema_version,
        timestamp,
        actor_id: draft.actor_id,
        sequence: tail.next_sequence,
        prev_hash: tail.hash,
        hash: Digest::new(algorithm, [0u8; 32]),
        payload: draft.payload,
    };
    envelope.hash = envelope.compute_hash(algorithm)?;
    Ok(envelope)
}

/// Check one envelope against the tail it claims to follow.
///
/// The stored hash is recomputed with the algorithm recorded in the
/// envelope itself, so chains that mix algorithms verify.
pub fn verify_link(tail: &ChainTail, envelope: &Envelope) -> Result<(), BreakReason> {
    if envelope.sequence != tail.next_sequence {
        return Err(BreakReason::SequenceOutOfOrder {
            expected: tail.next_sequence,
            found: envelope.sequence,
        });
    }
    if envelope.prev_hash != tail.hash {
        return Err(BreakReason::PrevHashMismatch {
            expected: tail.hash,
            found: envelope.prev_hash,
        });
    }
    let computed = envelope
        .compute_hash(envelope.hash.algorithm)
        .map_err(|e| BreakReason::Unhashable {
            detail: e.to_string(),
        })?;
    if computed != envelope.hash {
        return Err(BreakReason::HashMismatch {
            computed,
            stored: envelope.hash,
        });
    }
    Ok(())
}

/// Result of a successful verification pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub length: u64,
    pub tail: ChainTail,
}

/// Incremental verifier for envelopes arriving one at a time, e.g. from a
/// paged ledger read.
#[derive(Clone, Debug, Default)]
pub struct ChainVerifier {
    tail: ChainTail,
    verified: u64,
}

impl ChainVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a tail already known to be good.
    pub fn resume(tail: ChainTail) -> Self {
        Self { tail, verified: 0 }
    }

    pub fn push(&mut self, envelope: &Envelope) -> Result<(), ChainError> {
        verify_link(&self.tail, envelope).map_err(|reason| ChainError::HashBreakAt {
            sequence: envelope.sequence,
            reason,
        })?;
        self.tail = ChainTail::after(envelope);
        self.verified += 1;
        Ok(())
    }

    pub fn tail(&self) -> &ChainTail {
        &self.tail
    }

    pub fn finish(self) -> ChainSummary {
        ChainSummary {
            length: self.verified,
            tail: self.tail,
        }
    }
}

/// Verify a complete chain starting at genesis.
pub fn verify_chain<'a>(
    envelopes: impl IntoIterator<Item = &'a Envelope>,
) -> Result<ChainSummary, ChainError> {
    let mut verifier = ChainVerifier::new();
    for envelope in envelopes {
        verifier.push(envelope)?;
    }
    Ok(verifier.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeDraft;
    use chrono::Duration;
    use conclave_types::{ActorId, Branch, EventId, EventKind, TaskVerb};
    use proptest::prelude::*;
    use serde_json::json;

    fn build_chain(len: usize, algorithm: HashAlgorithm) -> Vec<Envelope> {
        let start = Utc::now();
        let mut tail = ChainTail::genesis();
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let draft = EnvelopeDraft::new(
                EventKind::Task {
                    branch: Branch::Executive,
                    verb: TaskVerb::Authorized,
                },
                ActorId::new("alice"),
                json!({"task_id": format!("t-{i}"), "i": i}),
            );
            let env = link(
                &tail,
                Candidate {
                    draft,
                    event_id: EventId::new(),
                    timestamp: start + Duration::seconds(i as i64),
                },
                algorithm,
            )
            .unwrap();
            tail = ChainTail::after(&env);
            out.push(env);
        }
        out
    }

    #[test]
    fn intact_chain_verifies() {
        let chain = build_chain(10, HashAlgorithm::Blake3);
        let summary = verify_chain(&chain).unwrap();
        assert_eq!(summary.length, 10);
        assert_eq!(summary.tail.last_sequence(), Some(9));
        assert_eq!(summary.tail.hash, chain[9].hash);
        assert_eq!(chain[0].prev_hash, Digest::GENESIS_SENTINEL);
    }

    #[test]
    fn mixed_algorithms_verify() {
        let mut chain = build_chain(3, HashAlgorithm::Blake3);
        let tail = ChainTail::after(&chain[2]);
        let next = link(
            &tail,
            Candidate {
                draft: EnvelopeDraft::new(
                    EventKind::Task {
                        branch: Branch::Executive,
                        verb: TaskVerb::Activated,
                    },
                    ActorId::new("alice"),
                    json!({"task_id": "t-0"}),
                ),
                event_id: EventId::new(),
                timestamp: Utc::now(),
            },
            HashAlgorithm::Sha256,
        )
        .unwrap();
        assert_eq!(next.hash.algorithm, HashAlgorithm::Sha256);
        chain.push(next);
        assert_eq!(verify_chain(&chain).unwrap().length, 4);
    }

    #[test]
    fn reordered_envelopes_fail_on_sequence() {
        let mut chain = build_chain(4, HashAlgorithm::Blake3);
        chain.swap(1, 2);
        let err = verify_chain(&chain).unwrap_err();
        assert!(matches!(
            err,
            ChainError::HashBreakAt {
                sequence: 2,
                reason: BreakReason::SequenceOutOfOrder { expected: 1, found: 2 }
            }
        ));
    }

    #[test]
    fn resumed_verifier_continues_from_known_tail() {
        let chain = build_chain(6, HashAlgorithm::Blake3);
        let mut verifier = ChainVerifier::resume(ChainTail::after(&chain[2]));
        for env in &chain[3..] {
            verifier.push(env).unwrap();
        }
        assert_eq!(verifier.finish().length, 3);
    }

    proptest! {
        #[test]
        fn tampering_is_reported_at_first_offending_sequence(
            len in 2usize..24,
            pick in any::<prop::sample::Index>(),
            mode in 0u8..3,
        ) {
            let mut chain = build_chain(len, HashAlgorithm::Blake3);
            let victim = pick.index(len);
            match mode {
                0 => chain[victim].prev_hash = HashAlgorithm::Blake3.digest(b"forged"),
                1 => chain[victim].hash = HashAlgorithm::Blake3.digest(b"forged"),
                _ => chain[victim].payload = json!({"task_id": "forged"}),
            }
            let err = verify_chain(&chain).unwrap_err();
            prop_assert_eq!(err.break_sequence(), Some(victim as u64));
        }

        #[test]
        fn rehashed_tamper_is_caught_by_successor(len in 3usize..16, pick in 0usize..14) {
            let mut chain = build_chain(len, HashAlgorithm::Blake3);
            let victim = pick % (len - 1);
            chain[victim].payload = json!({"task_id": "forged"});
            chain[victim].hash = chain[victim].compute_hash(HashAlgorithm::Blake3).unwrap();
            let err = verify_chain(&chain).unwrap_err();
            prop_assert_eq!(err.break_sequence(), Some(victim as u64 + 1));
        }
    }
}
