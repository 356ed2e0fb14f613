use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Returned by I/O entry points while a halt is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("halted (episode {epoch})")]
pub struct Halted {
    pub epoch: u64,
}

struct FlagState {
    halted: AtomicBool,
    epoch: AtomicU64,
}

/// The in-memory halt flag.
///
/// Cloning yields another handle to the same flag. Every code path that
/// performs I/O reads it first with [`HaltFlag::check`], which is a plain
/// atomic load: it never locks and never suspends. Only the halt circuit is
/// expected to raise or lower it.
#[derive(Clone)]
pub struct HaltFlag {
    state: Arc<FlagState>,
}

impl HaltFlag {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FlagState {
                halted: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::SeqCst)
    }

    /// Episode counter: the number of halts raised on this flag so far.
    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Halted> {
        if self.is_halted() {
            Err(Halted {
                epoch: self.epoch(),
            })
        } else {
            Ok(())
        }
    }

    /// Raise the flag. Returns the new episode number only for the call that
    /// actually flipped it; raising an already-raised flag returns `None`.
    pub fn raise(&self) -> Option<u64> {
        if self
            .state
            .halted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(self.state.epoch.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            None
        }
    }

    /// Raise the flag for an episode announced elsewhere. The local counter
    /// is moved forward to `epoch` so both sides agree on the episode number.
    pub fn adopt(&self, epoch: u64) -> bool {
        self.state.epoch.fetch_max(epoch, Ordering::SeqCst);
        self.state
            .halted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move the episode counter forward to `epoch` without raising the flag.
    /// The next [`HaltFlag::raise`] then starts episode `epoch + 1`.
    pub fn advance_epoch(&self, epoch: u64) -> u64 {
        self.state.epoch.fetch_max(epoch, Ordering::SeqCst).max(epoch)
    }

    /// Lower the flag, ending the current episode.
    pub fn lower(&self) -> bool {
        self.state
            .halted
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for HaltFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HaltFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltFlag")
            .field("halted", &self.is_halted())
            .field("epoch", &self.epoch())
            .finish()
    }
}
