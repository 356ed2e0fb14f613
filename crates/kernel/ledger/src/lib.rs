//! The constitutional ledger.
//!
//! [`LedgerStore`] is the single writer: it validates each draft against
//! the folded state of the chain, links it, makes it durable in a
//! segment-based [`WriteAheadLog`] and then notifies subscribers. A torn or
//! corrupt entry, or a chain break found on open, puts the store into an
//! integrity lock that only an operator can clear.

pub mod config;
pub mod error;
pub mod notify;
pub mod registry;
pub mod store;
pub mod validator;
pub mod wal;

pub use config::LedgerConfig;
pub use error::{AppendError, IntegrityFault, LedgerError};
pub use notify::{SequenceNotice, SequenceNotifier, SubscriptionId};
pub use registry::ActorRegistry;
pub use store::{LedgerOptions, LedgerStore};
pub use validator::Validator;
pub use wal::{
    quarantine_from, FileStorage, MemoryStorage, SegmentMeta, SyncMode, WalConfig, WalStorage,
    WriteAheadLog,
};
