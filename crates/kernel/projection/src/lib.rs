//! Replay and projection engine.
//!
//! Every queryable view is a pure fold of the ledger. The engine keeps the
//! live views current from ledger notices (continuous), recomputes and
//! compares them on a timer (periodic), and can drop and refold any view
//! from sequence 0 (manual). [`rebuild_from_export`] runs the same folds over
//! an exported ledger without a store.

pub mod engine;
pub mod error;
pub mod state;

pub use engine::{rebuild_from_export, DriftReport, ProjectionEngine};
pub use error::ProjectionError;
pub use state::{ProjectionName, ProjectionState, Views};
