//! Task and legitimacy state machines.
//!
//! Everything here is pure: [`next`] and [`next_band`] are total transition
//! functions, and [`TaskBoard`] / [`LegitimacyBoard`] fold ledger envelopes
//! into derived state deterministically. The ledger uses the same boards for
//! write-time validation and the projection engine for queryable views, so
//! the two can never disagree about what is legal.

pub mod band;
pub mod board;
pub mod fold;
pub mod legitimacy;
pub mod payload;
pub mod task;
pub mod timeout;

#[cfg(test)]
pub(crate) mod testing;

pub use band::{
    next_band, Acknowledgment, BandError, BandTrigger, LegitimacyBand, ViolationDensity,
    WindowedThresholds,
};
pub use board::{HaltStatus, TaskBoard, TaskBoardSnapshot, TaskCheckError, TaskRecord};
pub use fold::{Anomaly, AnomalyKind, Applied, Cursor, Fold, FoldError};
pub use legitimacy::{BandRecord, LegitimacyBoard, LegitimacySnapshot, RECENT_VIOLATION_CAP};
pub use payload::{HaltPayload, LegitimacyPayload, TaskPayload};
pub use task::{halt_disposition, next, IllegalTransition, TaskState};
pub use timeout::{due_transition, DueTransition, TimeoutPolicy, TimeoutReason};
