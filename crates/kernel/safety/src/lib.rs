//! The coercion-filter boundary.
//!
//! Participant-facing text must pass an external [`CoercionFilter`]. The
//! only way to obtain [`FilteredContent`] is [`screen`], and a
//! [`ParticipantMessage`] can only carry filtered content, so unfiltered
//! text cannot reach a participant by construction.

pub mod error;
pub mod filter;
pub mod gateway;

pub use error::SafetyError;
pub use filter::{
    screen, CoercionFilter, FilterOutcome, FilterVerdict, FilteredContent, ParticipantMessage,
    TermFilter, TermFilterConfig,
};
pub use gateway::{FilterGateway, FilterRecord};
