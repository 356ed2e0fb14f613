use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use conclave_kernel_chain::{Digest, Envelope};
use conclave_types::{ActorId, Branch, ClusterId, EventKind, HaltVerb, TaskId, TaskVerb};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fold::{admit, Admission, Anomaly, AnomalyKind, Applied, Cursor, Fold, FoldError};
use crate::payload::{HaltPayload, TaskPayload};
use crate::task::{halt_disposition, next, IllegalTransition, TaskState};
use crate::timeout::{due_transition, DueTransition, TimeoutPolicy};

/// Derived view of one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Branch that authorized the task.
    pub branch: Branch,
    pub current_state: TaskState,
    pub earl_id: ActorId,
    pub cluster_id: Option<ClusterId>,
    pub last_event_sequence: u64,
    pub last_applied_hash: Digest,
    pub state_entered_at: DateTime<Utc>,
    pub last_reason: Option<String>,
    /// Set when the halt table moved this task.
    pub halt_epoch: Option<u64>,
}

impl TaskRecord {
    fn enter(&mut self, state: TaskState, envelope: &Envelope) {
        self.current_state = state;
        self.last_event_sequence = envelope.sequence;
        self.last_applied_hash = envelope.hash;
        self.state_entered_at = envelope.timestamp;
    }
}

/// Whether a halt is in force as far as the ledger is concerned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltStatus {
    pub active: bool,
    pub epoch: u64,
    pub since_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskCheckError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} already authorized")]
    DuplicateTask(TaskId),

    #[error("routing task {0} requires a cluster_id")]
    MissingCluster(TaskId),

    #[error("task {task_id}: {error}")]
    Illegal {
        task_id: TaskId,
        error: IllegalTransition,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBoardSnapshot {
    pub cursor: Option<Cursor>,
    pub halt: HaltStatus,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub anomalies: Vec<Anomaly>,
}

/// The task projection as a pure fold.
///
/// `halt.circuit.triggered` migrates every task per the halt table inside a
/// single `apply`, so whoever holds the board sees all tasks pre-halt or all
/// tasks post-halt.
#[derive(Clone, Debug, Default)]
pub struct TaskBoard {
    tasks: BTreeMap<TaskId, TaskRecord>,
    halt: HaltStatus,
    anomalies: Vec<Anomaly>,
    cursor: Option<Cursor>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: TaskBoardSnapshot) -> Self {
        Self {
            tasks: snapshot.tasks,
            halt: snapshot.halt,
            anomalies: snapshot.anomalies,
            cursor: snapshot.cursor,
        }
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn halt(&self) -> HaltStatus {
        self.halt
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Write-time check of a task event against the current view. Returns
    /// the state the task would enter.
    pub fn check_task(
        &self,
        verb: TaskVerb,
        payload: &TaskPayload,
    ) -> Result<TaskState, TaskCheckError> {
        let task_id = &payload.task_id;
        match (self.tasks.get(task_id), verb) {
            (Some(_), TaskVerb::Authorized) => Err(TaskCheckError::DuplicateTask(task_id.clone())),
            (None, TaskVerb::Authorized) => Ok(TaskState::Authorized),
            (None, _) => Err(TaskCheckError::UnknownTask(task_id.clone())),
            (Some(record), verb) => {
                let to = next(record.current_state, verb).map_err(|error| {
                    TaskCheckError::Illegal {
                        task_id: task_id.clone(),
                        error,
                    }
                })?;
                if verb == TaskVerb::Routed && payload.cluster_id.is_none() {
                    return Err(TaskCheckError::MissingCluster(task_id.clone()));
                }
                Ok(to)
            }
        }
    }

    /// Automatic transitions due at `now`, in task id order.
    pub fn due(&self, policy: &TimeoutPolicy, now: DateTime<Utc>) -> Vec<DueTransition> {
        self.tasks
            .values()
            .filter_map(|record| due_transition(record, policy, now))
            .collect()
    }

    fn anomaly(&mut self, envelope: &Envelope, issue: AnomalyKind) -> Applied {
        let anomaly = Anomaly {
            sequence: envelope.sequence,
            event_type: envelope.event_type.clone(),
            issue,
        };
        self.anomalies.push(anomaly.clone());
        Applied::Anomaly(anomaly)
    }

    fn apply_task(&mut self, envelope: &Envelope, branch: Branch, verb: TaskVerb) -> Applied {
        let payload: TaskPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return self.anomaly(
                    envelope,
                    AnomalyKind::InvalidPayload {
                        detail: e.to_string(),
                    },
                )
            }
        };
        let task_id = payload.task_id.clone();

        if verb == TaskVerb::Authorized {
            if self.tasks.contains_key(&task_id) {
                return self.anomaly(envelope, AnomalyKind::DuplicateTask { task_id });
            }
            let record = TaskRecord {
                task_id: task_id.clone(),
                branch,
                current_state: TaskState::Authorized,
                earl_id: payload
                    .earl_id
                    .unwrap_or_else(|| envelope.actor_id.clone()),
                cluster_id: payload.cluster_id,
                last_event_sequence: envelope.sequence,
                last_applied_hash: envelope.hash,
                state_entered_at: envelope.timestamp,
                last_reason: payload.reason,
                halt_epoch: None,
            };
            self.tasks.insert(task_id, record);
            return Applied::Changed;
        }

        let outcome = match self.tasks.get_mut(&task_id) {
            None => Err(AnomalyKind::UnknownTask {
                task_id: task_id.clone(),
            }),
            Some(record) => match next(record.current_state, verb) {
                Ok(to) => {
                    record.enter(to, envelope);
                    if payload.cluster_id.is_some() {
                        record.cluster_id = payload.cluster_id;
                    }
                    record.last_reason = payload.reason;
                    Ok(())
                }
                Err(error) => Err(AnomalyKind::IllegalTransition {
                    task_id: task_id.clone(),
                    error,
                }),
            },
        };
        match outcome {
            Ok(()) => Applied::Changed,
            Err(issue) => self.anomaly(envelope, issue),
        }
    }

    fn apply_halt(&mut self, envelope: &Envelope, verb: HaltVerb) -> Applied {
        let payload: HaltPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return self.anomaly(
                    envelope,
                    AnomalyKind::InvalidPayload {
                        detail: e.to_string(),
                    },
                )
            }
        };
        match verb {
            HaltVerb::Triggered => {
                if self.halt.active && self.halt.epoch == payload.epoch {
                    return Applied::Ignored;
                }
                self.halt = HaltStatus {
                    active: true,
                    epoch: payload.epoch,
                    since_sequence: Some(envelope.sequence),
                };
                for record in self.tasks.values_mut() {
                    let to = halt_disposition(record.current_state);
                    if to != record.current_state {
                        record.enter(to, envelope);
                        record.halt_epoch = Some(payload.epoch);
                        record.last_reason = None;
                    }
                }
                Applied::Changed
            }
            HaltVerb::Released => {
                if !self.halt.active {
                    return Applied::Ignored;
                }
                self.halt.active = false;
                Applied::Changed
            }
        }
    }
}

impl Fold for TaskBoard {
    type Snapshot = TaskBoardSnapshot;

    fn apply(&mut self, envelope: &Envelope) -> Result<Applied, FoldError> {
        if let Admission::Replay = admit(self.cursor.as_ref(), envelope)? {
            return Ok(Applied::AlreadyApplied);
        }
        let applied = match envelope.kind() {
            Err(_) => self.anomaly(envelope, AnomalyKind::UnknownEventType),
            Ok(EventKind::Task { branch, verb }) => self.apply_task(envelope, branch, verb),
            Ok(EventKind::Halt(verb)) => self.apply_halt(envelope, verb),
            Ok(_) => Applied::Ignored,
        };
        self.cursor = Some(Cursor::of(envelope));
        Ok(applied)
    }

    fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    fn snapshot(&self) -> TaskBoardSnapshot {
        TaskBoardSnapshot {
            cursor: self.cursor,
            halt: self.halt,
            tasks: self.tasks.clone(),
            anomalies: self.anomalies.clone(),
        }
    }
}
