//! The halt circuit.
//!
//! A halt is three channels in strict priority. The in-memory
//! [`HaltFlag`](conclave_types::HaltFlag) is the only one correctness rests
//! on; the broadcast and the ledger record are best effort and their loss
//! never lifts or delays a halt.

pub mod channel;
pub mod circuit;
pub mod error;

pub use channel::{ChannelBroadcaster, HaltBroadcaster, HaltRecorder, HaltSignal};
pub use circuit::{ChannelOutcome, HaltCircuit, HaltConfig, HaltReport};
pub use error::HaltError;
