use conclave_kernel_chain::ChainError;
use conclave_kernel_lifecycle::{BandError, IllegalTransition};
use conclave_types::{ActorId, Halted, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the store stopped accepting writes.
///
/// Every variant names the segment and byte offset where the valid prefix
/// ends, which is where the operator's recovery step cuts.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityFault {
    #[error("torn write at segment {segment_id} offset {offset}")]
    TornTail { segment_id: u64, offset: u64 },

    #[error("corrupt entry at segment {segment_id} offset {offset}: {reason}")]
    Corruption {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("hash chain break at sequence {sequence}: {reason}")]
    ChainBreak {
        segment_id: u64,
        offset: u64,
        sequence: u64,
        reason: String,
    },

    #[error("write at segment {segment_id} offset {offset} failed after partial persistence: {reason}")]
    WriteFailure {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    /// The write-time validator could not fold a committed entry, even
    /// after a rebuild from the chain. The cut drops that entry.
    #[error("validator diverged at sequence {sequence}: {reason}")]
    ValidatorDivergence {
        segment_id: u64,
        offset: u64,
        sequence: u64,
        reason: String,
    },
}

impl IntegrityFault {
    pub fn segment_id(&self) -> u64 {
        match self {
            IntegrityFault::TornTail { segment_id, .. }
            | IntegrityFault::Corruption { segment_id, .. }
            | IntegrityFault::ChainBreak { segment_id, .. }
            | IntegrityFault::WriteFailure { segment_id, .. }
            | IntegrityFault::ValidatorDivergence { segment_id, .. } => *segment_id,
        }
    }

    /// Byte offset in the faulted segment where the valid prefix ends.
    pub fn offset(&self) -> u64 {
        match self {
            IntegrityFault::TornTail { offset, .. }
            | IntegrityFault::Corruption { offset, .. }
            | IntegrityFault::ChainBreak { offset, .. }
            | IntegrityFault::WriteFailure { offset, .. }
            | IntegrityFault::ValidatorDivergence { offset, .. } => *offset,
        }
    }
}

/// Storage-level failures.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger storage unavailable")]
    Unavailable,

    #[error("segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("corrupt entry at segment {segment_id} offset {offset}: {reason}")]
    Corruption {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ledger is integrity-locked: {0}")]
    IntegrityLocked(IntegrityFault),

    #[error("ledger is not integrity-locked")]
    NotLocked,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("sequence {0} is beyond the ledger tail")]
    OutOfRange(u64),

    #[error("write-ahead log has no open segment")]
    Closed,

    #[error("append task failed: {0}")]
    Task(String),

    #[error("recovery append rejected: {0}")]
    Recovery(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

/// Why an append was refused. Nothing was written in any of these cases.
#[derive(Error, Debug)]
pub enum AppendError {
    #[error("task {task_id}: {error}")]
    IllegalTransition {
        task_id: TaskId,
        error: IllegalTransition,
    },

    /// The freshly linked envelope failed its own verification. The store
    /// is the only writer, so this means corruption; the store locks.
    #[error("hash chain break at sequence {sequence}")]
    HashChainBreak { sequence: u64 },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),

    #[error("actor {actor} may not write {event_type}")]
    ActorNotPermitted { actor: ActorId, event_type: String },

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("invalid payload for {event_type}: {detail}")]
    InvalidPayload { event_type: String, detail: String },

    /// A record-keeping event for an episode/epoch the ledger already holds.
    #[error("{event_type} for {key} is already recorded")]
    DuplicateRecord { event_type: String, key: u64 },

    #[error(transparent)]
    Band(#[from] BandError),

    #[error(transparent)]
    Halted(#[from] Halted),

    #[error("ledger is integrity-locked: {0}")]
    IntegrityLocked(IntegrityFault),

    #[error("storage failure: {0}")]
    Storage(#[from] LedgerError),
}

impl AppendError {
    /// Rejections caused by the caller rather than by the ledger.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            AppendError::HashChainBreak { .. }
                | AppendError::Halted(_)
                | AppendError::IntegrityLocked(_)
                | AppendError::Storage(_)
        )
    }
}
