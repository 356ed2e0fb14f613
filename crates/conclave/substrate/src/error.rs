use conclave_kernel_halt::HaltError;
use conclave_kernel_ledger::{AppendError, LedgerError};
use conclave_kernel_merkle::MerkleError;
use conclave_kernel_projection::ProjectionError;
use conclave_kernel_witness::WitnessError;
use conclave_types::Halted;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("logging setup failed: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Halted(#[from] Halted),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Append(#[from] AppendError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Halt(#[from] HaltError),

    #[error(transparent)]
    Witness(#[from] WitnessError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
