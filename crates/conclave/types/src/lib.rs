//! Shared vocabulary of the Conclave constitutional event substrate.
//!
//! - Identifiers for events, actors, tasks, clusters and tracked entities
//! - The closed [`EventKind`] enumeration: every `branch.noun.verb` event type
//!   the ledger accepts, with the branch always derived from the type
//! - The process-local [`HaltFlag`] read by every I/O entry point
//! - An injectable [`Clock`]

pub mod clock;
pub mod halt;
pub mod ids;
pub mod kind;

pub use clock::{Clock, ManualClock, SystemClock};
pub use halt::{HaltFlag, Halted};
pub use ids::{ActorId, ClusterId, EntityId, EventId, TaskId};
pub use kind::{
    Branch, EventKind, FilterVerb, HaltVerb, LedgerVerb, LegitimacyVerb, TaskVerb,
    UnknownEventType, WitnessVerb,
};
