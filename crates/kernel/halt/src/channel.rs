use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_kernel_chain::EnvelopeDraft;
use conclave_kernel_ledger::{AppendError, LedgerStore};
use conclave_kernel_lifecycle::HaltPayload;
use conclave_types::{ActorId, EventKind, HaltVerb};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::HaltError;

/// What one process tells the others when it halts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltSignal {
    pub epoch: u64,
    pub triggered_by: ActorId,
    pub at: DateTime<Utc>,
}

/// Best-effort propagation to other processes. Losing a broadcast never
/// affects the local halt.
#[async_trait]
pub trait HaltBroadcaster: Send + Sync {
    async fn broadcast(&self, signal: &HaltSignal) -> Result<(), HaltError>;
}

/// The ledger channel: written after the flag, never before.
#[async_trait]
pub trait HaltRecorder: Send + Sync {
    async fn record_trigger(&self, signal: &HaltSignal) -> Result<(), HaltError>;

    async fn record_release(&self, epoch: u64, released_by: &ActorId) -> Result<(), HaltError>;
}

/// In-process broadcaster over a tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<HaltSignal>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HaltSignal> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl HaltBroadcaster for ChannelBroadcaster {
    async fn broadcast(&self, signal: &HaltSignal) -> Result<(), HaltError> {
        let receivers = self
            .sender
            .send(signal.clone())
            .map_err(|_| HaltError::Broadcast("no listeners".into()))?;
        debug!(epoch = signal.epoch, receivers, "Halt broadcast sent");
        Ok(())
    }
}

#[async_trait]
impl HaltRecorder for LedgerStore {
    async fn record_trigger(&self, signal: &HaltSignal) -> Result<(), HaltError> {
        let payload = HaltPayload {
            epoch: signal.epoch,
            requested_by: Some(signal.triggered_by.clone()),
        };
        append_halt(self, HaltVerb::Triggered, payload).await
    }

    async fn record_release(&self, epoch: u64, released_by: &ActorId) -> Result<(), HaltError> {
        let payload = HaltPayload {
            epoch,
            requested_by: Some(released_by.clone()),
        };
        append_halt(self, HaltVerb::Released, payload).await
    }
}

async fn append_halt(
    ledger: &LedgerStore,
    verb: HaltVerb,
    payload: HaltPayload,
) -> Result<(), HaltError> {
    let epoch = payload.epoch;
    let value = serde_json::to_value(&payload).map_err(|e| HaltError::Record {
        epoch,
        reason: e.to_string(),
    })?;
    let draft = EnvelopeDraft::new(EventKind::Halt(verb), ActorId::halt_circuit(), value);
    match ledger.append(draft).await {
        Ok(_) => Ok(()),
        // Only a retry of the episode already in force counts as recorded.
        Err(AppendError::DuplicateRecord { .. }) => {
            let recorded = ledger.halt_status().await;
            if recorded.active && recorded.epoch == epoch {
                Ok(())
            } else {
                Err(HaltError::Record {
                    epoch,
                    reason: format!(
                        "episode {epoch} already recorded; ledger is at episode {} (active: {})",
                        recorded.epoch, recorded.active
                    ),
                })
            }
        }
        Err(e) => Err(HaltError::Record {
            epoch,
            reason: e.to_string(),
        }),
    }
}
