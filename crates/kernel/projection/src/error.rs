use conclave_kernel_chain::ChainError;
use conclave_kernel_ledger::LedgerError;
use conclave_kernel_lifecycle::FoldError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("unknown projection: {0}")]
    UnknownProjection(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("fold failed: {0}")]
    Fold(#[from] FoldError),

    #[error("export rejected: {0}")]
    Chain(#[from] ChainError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProjectionError {
    fn from(e: serde_json::Error) -> Self {
        ProjectionError::Serialization(e.to_string())
    }
}
