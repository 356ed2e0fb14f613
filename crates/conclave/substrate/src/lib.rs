//! The constitutional event substrate.
//!
//! [`Substrate`] wires one [`HaltFlag`](conclave_types::HaltFlag) into the
//! ledger, the halt circuit and the filter gateway, and runs the derived
//! services (projections, merkle epochs, witness, timeout sweeper,
//! legitimacy monitor) as background loops beside the ledger.

pub mod config;
pub mod error;
pub mod monitor;
pub mod substrate;
pub mod sweeper;
pub mod telemetry;

pub use config::{
    ActorsConfig, BandThreshold, LegitimacyConfig, LoggingConfig, ProjectionConfig, ServerConfig,
    SubstrateConfig, TimeoutConfig,
};
pub use error::SubstrateError;
pub use monitor::LegitimacyMonitor;
pub use substrate::{Substrate, SubstrateHealth, SubstrateOptions, SubstrateTasks};
pub use sweeper::TimeoutSweeper;
