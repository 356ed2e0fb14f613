use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaltError {
    #[error("no halt is in force")]
    NotHalted,

    #[error("halt broadcast failed: {0}")]
    Broadcast(String),

    #[error("halt record for episode {epoch} failed: {reason}")]
    Record { epoch: u64, reason: String },

    #[error("halt record for episode {epoch} timed out")]
    RecordTimedOut { epoch: u64 },

    /// Release needs the triggering record in the ledger first.
    #[error("episode {epoch} is not recorded yet; cannot release")]
    RecordPending { epoch: u64 },
}
