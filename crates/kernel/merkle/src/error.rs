use conclave_kernel_chain::Digest;
use conclave_kernel_ledger::{AppendError, LedgerError};
use conclave_types::EventId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MerkleError {
    #[error("event {0} is not in any epoch")]
    UnknownEvent(EventId),

    #[error("event {event_id} is in epoch {epoch}, which is not sealed yet")]
    NotYetSealed { event_id: EventId, epoch: u64 },

    #[error("expected sequence {expected}, got {found}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("epoch {epoch}: recorded root {recorded} differs from recomputed {computed}")]
    RootMismatch {
        epoch: u64,
        recorded: Digest,
        computed: Digest,
    },

    #[error("publishing epoch {epoch} failed: {source}")]
    Publish {
        epoch: u64,
        #[source]
        source: AppendError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MerkleError {
    fn from(e: serde_json::Error) -> Self {
        MerkleError::Serialization(e.to_string())
    }
}
