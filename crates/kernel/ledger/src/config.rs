use std::path::PathBuf;
use std::time::Duration;

use conclave_kernel_chain::HashAlgorithm;
use serde::{Deserialize, Serialize};

use crate::wal::{SyncMode, WalConfig};

/// Ledger store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory holding WAL segments. `None` keeps the ledger in memory.
    pub data_dir: Option<PathBuf>,
    /// Algorithm new envelopes are hashed with.
    pub hash_algorithm: HashAlgorithm,
    pub max_segment_size: u64,
    pub sync_mode: SyncMode,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    /// Envelopes fetched per page by `read_events`.
    pub read_page_size: usize,
    /// Per-subscriber notice buffer.
    pub notify_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("data/ledger")),
            hash_algorithm: HashAlgorithm::Blake3,
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
            batch_interval_ms: 10,
            max_batch_size: 1000,
            read_page_size: 256,
            notify_capacity: 1024,
        }
    }
}

impl LedgerConfig {
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            ..Self::default()
        }
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            max_segment_size: self.max_segment_size,
            sync_mode: self.sync_mode,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            max_batch_size: self.max_batch_size,
        }
    }
}
