use std::collections::BTreeSet;

use conclave_kernel_chain::{Envelope, EnvelopeDraft};
use conclave_kernel_lifecycle::{
    Fold, FoldError, HaltPayload, HaltStatus, LegitimacyBoard, LegitimacyPayload, TaskBoard,
    TaskCheckError, TaskPayload,
};
use conclave_types::{EventKind, HaltVerb, LedgerVerb};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::AppendError;

#[derive(Deserialize)]
struct EpochRef {
    epoch: u64,
}

/// The ledger's own view of derived state, used only to decide whether a
/// draft is legal. It folds exactly the envelopes the store commits, inside
/// the same critical section, so validation always sees the current tail.
#[derive(Debug, Default)]
pub struct Validator {
    tasks: TaskBoard,
    bands: LegitimacyBoard,
    halt_epochs: BTreeSet<u64>,
    sealed_epochs: BTreeSet<u64>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &TaskBoard {
        &self.tasks
    }

    pub fn bands(&self) -> &LegitimacyBoard {
        &self.bands
    }

    pub fn halt_status(&self) -> HaltStatus {
        self.tasks.halt()
    }

    pub fn check(
        &self,
        kind: EventKind,
        draft: &EnvelopeDraft,
        next_sequence: u64,
    ) -> Result<(), AppendError> {
        let invalid = |detail: String| AppendError::InvalidPayload {
            event_type: draft.event_type.clone(),
            detail,
        };

        if next_sequence == 0 && kind != EventKind::Ledger(LedgerVerb::Genesis) {
            return Err(invalid("the ledger must open with its genesis event".into()));
        }

        match kind {
            EventKind::Task { verb, .. } => {
                let payload: TaskPayload = parse(draft)?;
                self.tasks
                    .check_task(verb, &payload)
                    .map_err(|e| match e {
                        TaskCheckError::UnknownTask(id) => AppendError::UnknownTask(id),
                        TaskCheckError::DuplicateTask(id) => AppendError::DuplicateTask(id),
                        TaskCheckError::MissingCluster(id) => {
                            invalid(format!("routing task {id} requires a cluster_id"))
                        }
                        TaskCheckError::Illegal { task_id, error } => {
                            AppendError::IllegalTransition { task_id, error }
                        }
                    })?;
            }
            EventKind::Legitimacy(verb) => {
                let payload: LegitimacyPayload = parse(draft)?;
                self.bands.check_band(verb, &payload, &draft.actor_id)?;
            }
            EventKind::Halt(HaltVerb::Triggered) => {
                let payload: HaltPayload = parse(draft)?;
                if self.halt_epochs.contains(&payload.epoch) {
                    return Err(AppendError::DuplicateRecord {
                        event_type: draft.event_type.clone(),
                        key: payload.epoch,
                    });
                }
            }
            EventKind::Halt(HaltVerb::Released) => {
                let payload: HaltPayload = parse(draft)?;
                let status = self.tasks.halt();
                if !status.active || status.epoch != payload.epoch {
                    return Err(invalid(format!(
                        "no recorded halt in force for episode {}",
                        payload.epoch
                    )));
                }
            }
            EventKind::MerkleEpochSealed => {
                let sealed: EpochRef = parse(draft)?;
                if self.sealed_epochs.contains(&sealed.epoch) {
                    return Err(AppendError::DuplicateRecord {
                        event_type: draft.event_type.clone(),
                        key: sealed.epoch,
                    });
                }
            }
            EventKind::Ledger(LedgerVerb::Genesis) => {
                if next_sequence != 0 {
                    return Err(invalid("genesis is only valid at sequence 0".into()));
                }
            }
            EventKind::Ledger(LedgerVerb::IntegrityViolated)
            | EventKind::Witness(_)
            | EventKind::Filter(_) => {
                if !draft.payload.is_object() {
                    return Err(invalid("payload must be an object".into()));
                }
            }
        }
        Ok(())
    }

    /// Fold a committed envelope.
    pub fn absorb(&mut self, envelope: &Envelope) -> Result<(), FoldError> {
        self.tasks.apply(envelope)?;
        self.bands.apply(envelope)?;
        match envelope.kind() {
            Ok(EventKind::Halt(HaltVerb::Triggered)) => {
                if let Ok(payload) = envelope.payload_as::<HaltPayload>() {
                    self.halt_epochs.insert(payload.epoch);
                }
            }
            Ok(EventKind::MerkleEpochSealed) => match envelope.payload_as::<EpochRef>() {
                Ok(sealed) => {
                    self.sealed_epochs.insert(sealed.epoch);
                }
                Err(e) => warn!(sequence = envelope.sequence, error = %e, "Unreadable epoch record"),
            },
            _ => {}
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(draft: &EnvelopeDraft) -> Result<T, AppendError> {
    T::deserialize(&draft.payload).map_err(|e| AppendError::InvalidPayload {
        event_type: draft.event_type.clone(),
        detail: e.to_string(),
    })
}
