use conclave_kernel_chain::{Digest, Envelope};
use conclave_types::TaskId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::band::BandError;
use crate::task::IllegalTransition;

/// Position of a fold in the ledger: the last envelope it has absorbed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub sequence: u64,
    pub hash: Digest,
}

impl Cursor {
    pub fn of(envelope: &Envelope) -> Self {
        Self {
            sequence: envelope.sequence,
            hash: envelope.hash,
        }
    }
}

/// What applying one envelope did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// State changed.
    Changed,
    /// Absorbed; this fold has nothing to derive from it.
    Ignored,
    /// Already reflected at or below the cursor.
    AlreadyApplied,
    /// The ledger holds an entry this fold cannot interpret; recorded and skipped.
    Anomaly(Anomaly),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FoldError {
    #[error("sequence {sequence} already applied with hash {applied}, offered {offered}")]
    HashConflict {
        sequence: u64,
        applied: Digest,
        offered: Digest,
    },

    #[error("expected sequence {expected}, got {found}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("sequence {sequence} does not link to the applied tail")]
    BrokenLink { sequence: u64 },
}

/// An entry found in the ledger that the fold could not apply. Anomalies are
/// part of the derived state so two rebuilds of the same ledger agree on them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub sequence: u64,
    pub event_type: String,
    pub issue: AnomalyKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    UnknownEventType,
    InvalidPayload { detail: String },
    UnknownTask { task_id: TaskId },
    DuplicateTask { task_id: TaskId },
    IllegalTransition { task_id: TaskId, error: IllegalTransition },
    Band { error: BandError },
}

/// A deterministic left fold over ledger envelopes.
pub trait Fold {
    type Snapshot: Serialize;

    fn apply(&mut self, envelope: &Envelope) -> Result<Applied, FoldError>;

    fn cursor(&self) -> Option<Cursor>;

    fn snapshot(&self) -> Self::Snapshot;
}

pub(crate) enum Admission {
    Fresh,
    Replay,
}

/// Decide whether `envelope` is the next one for a fold sitting at `cursor`.
pub(crate) fn admit(cursor: Option<&Cursor>, envelope: &Envelope) -> Result<Admission, FoldError> {
    let Some(cursor) = cursor else {
        return if envelope.sequence == 0 {
            Ok(Admission::Fresh)
        } else {
            Err(FoldError::OutOfOrder {
                expected: 0,
                found: envelope.sequence,
            })
        };
    };

    if envelope.sequence < cursor.sequence {
        return Ok(Admission::Replay);
    }
    if envelope.sequence == cursor.sequence {
        return if envelope.hash == cursor.hash {
            Ok(Admission::Replay)
        } else {
            Err(FoldError::HashConflict {
                sequence: envelope.sequence,
                applied: cursor.hash,
                offered: envelope.hash,
            })
        };
    }
    if envelope.sequence != cursor.sequence + 1 {
        return Err(FoldError::OutOfOrder {
            expected: cursor.sequence + 1,
            found: envelope.sequence,
        });
    }
    if envelope.prev_hash != cursor.hash {
        return Err(FoldError::BrokenLink {
            sequence: envelope.sequence,
        });
    }
    Ok(Admission::Fresh)
}
