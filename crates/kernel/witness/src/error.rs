use conclave_kernel_ledger::LedgerError;
use thiserror::Error;

/// Failures reading the ledger. Recording failures never surface here.
#[derive(Error, Debug)]
pub enum WitnessError {
    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
