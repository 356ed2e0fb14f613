//! The witness observer.
//!
//! Folds the ledger next to the projections, tracking the next sequence it
//! expects both from reads and from notices. Gaps and chain irregularities
//! become `witness.*` events in the ledger itself; nothing is ever raised to
//! a caller.

pub mod error;
pub mod finding;
pub mod observer;
pub mod service;

pub use error::WitnessError;
pub use finding::{Finding, FindingKey, GapFinding, GapSource, ViolationFinding, ViolationKind};
pub use observer::WitnessState;
pub use service::{SweepReport, Witness};
