use conclave_kernel_ledger::AppendError;
use conclave_types::Halted;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error(transparent)]
    Halted(#[from] Halted),

    /// The outcome could not be recorded, so it is not released.
    #[error("filter outcome not recorded: {0}")]
    Record(#[from] AppendError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
