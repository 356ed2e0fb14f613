use std::sync::Arc;
use std::time::Duration;

use conclave_types::{ActorId, Clock, HaltFlag};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use crate::channel::{HaltBroadcaster, HaltRecorder, HaltSignal};
use crate::error::HaltError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HaltConfig {
    pub broadcast_timeout_ms: u64,
    pub record_timeout_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout_ms: 250,
            record_timeout_ms: 2000,
            broadcast_capacity: 16,
        }
    }
}

/// How one secondary channel fared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Delivered,
    /// Not attempted on this call.
    Skipped,
    Failed { reason: String },
    TimedOut,
}

impl ChannelOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ChannelOutcome::Delivered)
    }
}

/// Result of [`HaltCircuit::trigger`]. The halt is in force whatever the
/// channel outcomes say.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReport {
    pub epoch: u64,
    pub newly_triggered: bool,
    pub broadcast: ChannelOutcome,
    pub record: ChannelOutcome,
}

/// The halt circuit.
///
/// Channel one is the shared [`HaltFlag`], set synchronously before the
/// first await of a trigger. Channels two (broadcast) and three (ledger
/// record) follow under timeouts, and neither can undo or delay the flag.
/// A record that failed stays pending until it is retried or the halt is
/// released.
pub struct HaltCircuit {
    flag: HaltFlag,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn HaltBroadcaster>,
    recorder: Arc<dyn HaltRecorder>,
    config: HaltConfig,
    pending: Mutex<Option<HaltSignal>>,
}

impl HaltCircuit {
    pub fn new(
        flag: HaltFlag,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn HaltBroadcaster>,
        recorder: Arc<dyn HaltRecorder>,
        config: HaltConfig,
    ) -> Self {
        Self {
            flag,
            clock,
            broadcaster,
            recorder,
            config,
            pending: Mutex::new(None),
        }
    }

    pub fn flag(&self) -> &HaltFlag {
        &self.flag
    }

    pub fn is_halted(&self) -> bool {
        self.flag.is_halted()
    }

    /// Pull the circuit. Idempotent: while halted, a repeat call only
    /// retries a pending record.
    pub async fn trigger(&self, actor: ActorId) -> HaltReport {
        let Some(epoch) = self.flag.raise() else {
            let record = self.retry_pending_record().await;
            return HaltReport {
                epoch: self.flag.epoch(),
                newly_triggered: false,
                broadcast: ChannelOutcome::Skipped,
                record,
            };
        };
        warn!(epoch, actor = %actor, "HALT triggered; all I/O entry points now refuse work");

        let signal = HaltSignal {
            epoch,
            triggered_by: actor,
            at: self.clock.now(),
        };
        *self.pending.lock().await = Some(signal.clone());

        let broadcast = self.broadcast(&signal).await;
        let record = self.retry_pending_record().await;
        if !broadcast.is_delivered() || !record.is_delivered() {
            warn!(
                epoch,
                broadcast = ?broadcast,
                record = ?record,
                "Halt in force with degraded secondary channels"
            );
        }
        HaltReport {
            epoch,
            newly_triggered: true,
            broadcast,
            record,
        }
    }

    async fn broadcast(&self, signal: &HaltSignal) -> ChannelOutcome {
        let timeout = Duration::from_millis(self.config.broadcast_timeout_ms);
        match tokio::time::timeout(timeout, self.broadcaster.broadcast(signal)).await {
            Ok(Ok(())) => ChannelOutcome::Delivered,
            Ok(Err(e)) => {
                warn!(epoch = signal.epoch, error = %e, "Halt broadcast failed");
                ChannelOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(epoch = signal.epoch, "Halt broadcast timed out");
                ChannelOutcome::TimedOut
            }
        }
    }

    /// Write the pending halt record, if any.
    pub async fn retry_pending_record(&self) -> ChannelOutcome {
        let mut pending = self.pending.lock().await;
        let Some(signal) = pending.clone() else {
            return ChannelOutcome::Skipped;
        };
        let timeout = Duration::from_millis(self.config.record_timeout_ms);
        match tokio::time::timeout(timeout, self.recorder.record_trigger(&signal)).await {
            Ok(Ok(())) => {
                *pending = None;
                info!(epoch = signal.epoch, "Halt recorded in ledger");
                ChannelOutcome::Delivered
            }
            Ok(Err(e)) => {
                error!(epoch = signal.epoch, error = %e, "Halt record failed; halt remains in force");
                ChannelOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                error!(epoch = signal.epoch, "Halt record timed out; halt remains in force");
                ChannelOutcome::TimedOut
            }
        }
    }

    pub async fn has_pending_record(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Honour a halt announced by another process. Sets the flag only; the
    /// announcing process owns the broadcast and the record.
    pub fn adopt(&self, signal: &HaltSignal) -> bool {
        let adopted = self.flag.adopt(signal.epoch);
        if adopted {
            warn!(
                epoch = signal.epoch,
                triggered_by = %signal.triggered_by,
                "HALT adopted from broadcast"
            );
        }
        adopted
    }

    /// Adopt halts from `signals` until `shutdown` flips.
    pub async fn follow(
        &self,
        mut signals: broadcast::Receiver<HaltSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = signals.recv() => match received {
                    Ok(signal) => {
                        self.adopt(&signal);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Halt listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// End the current episode: make sure the trigger is recorded, record
    /// the release, then lower the flag.
    pub async fn release(&self, actor: ActorId) -> Result<u64, HaltError> {
        if !self.flag.is_halted() {
            return Err(HaltError::NotHalted);
        }
        let epoch = self.flag.epoch();
        match self.retry_pending_record().await {
            ChannelOutcome::Delivered | ChannelOutcome::Skipped => {}
            ChannelOutcome::Failed { .. } | ChannelOutcome::TimedOut => {
                return Err(HaltError::RecordPending { epoch });
            }
        }

        let timeout = Duration::from_millis(self.config.record_timeout_ms);
        tokio::time::timeout(timeout, self.recorder.record_release(epoch, &actor))
            .await
            .map_err(|_| HaltError::RecordTimedOut { epoch })??;
        self.flag.lower();
        info!(epoch, actor = %actor, "Halt released");
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBroadcaster;
    use async_trait::async_trait;
    use conclave_kernel_chain::EnvelopeDraft;
    use conclave_kernel_ledger::{LedgerConfig, LedgerOptions, LedgerStore, MemoryStorage};
    use conclave_kernel_lifecycle::TaskState;
    use conclave_kernel_projection::ProjectionEngine;
    use conclave_types::{Branch, EventKind, SystemClock, TaskId, TaskVerb};
    use serde_json::json;

    struct Fixture {
        storage: MemoryStorage,
        ledger: LedgerStore,
        broadcaster: ChannelBroadcaster,
        circuit: HaltCircuit,
    }

    async fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let flag = HaltFlag::new();
        let ledger = LedgerStore::open(
            LedgerConfig::in_memory(),
            Arc::new(storage.clone()),
            LedgerOptions {
                flag: flag.clone(),
                ..LedgerOptions::default()
            },
        )
        .await
        .unwrap();
        let broadcaster = ChannelBroadcaster::new(8);
        let circuit = HaltCircuit::new(
            flag,
            Arc::new(SystemClock),
            Arc::new(broadcaster.clone()),
            Arc::new(ledger.clone()),
            HaltConfig::default(),
        );
        Fixture {
            storage,
            ledger,
            broadcaster,
            circuit,
        }
    }

    async fn walk(ledger: &LedgerStore, task: &str, verbs: &[TaskVerb]) {
        for verb in verbs {
            let mut payload = json!({ "task_id": task });
            if *verb == TaskVerb::Routed {
                payload["cluster_id"] = json!("cluster-a");
            }
            let kind = EventKind::Task {
                branch: Branch::Executive,
                verb: *verb,
            };
            ledger
                .append(EnvelopeDraft::new(kind, ActorId::new("earl"), payload))
                .await
                .unwrap();
        }
    }

    async fn halt_records(ledger: &LedgerStore) -> Vec<String> {
        ledger
            .export()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type.starts_with("halt."))
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn trigger_sets_flag_and_records() {
        let f = fixture().await;
        let _listener = f.broadcaster.subscribe();
        let report = f.circuit.trigger(ActorId::new("earl")).await;

        assert_eq!(report.epoch, 1);
        assert!(report.newly_triggered);
        assert_eq!(report.broadcast, ChannelOutcome::Delivered);
        assert_eq!(report.record, ChannelOutcome::Delivered);
        assert!(f.circuit.is_halted());
        assert_eq!(halt_records(&f.ledger).await, vec!["halt.circuit.triggered"]);
        assert!(f.ledger.halt_status().await.active);
    }

    #[tokio::test]
    async fn repeat_trigger_is_a_no_op() {
        let f = fixture().await;
        let first = f.circuit.trigger(ActorId::new("earl")).await;
        let second = f.circuit.trigger(ActorId::new("earl")).await;

        assert_eq!(second.epoch, first.epoch);
        assert!(!second.newly_triggered);
        assert_eq!(second.broadcast, ChannelOutcome::Skipped);
        assert_eq!(second.record, ChannelOutcome::Skipped);
        assert_eq!(halt_records(&f.ledger).await.len(), 1);
    }

    #[tokio::test]
    async fn halt_holds_while_ledger_is_down() {
        let f = fixture().await;
        f.storage.set_unavailable(true);

        let report = f.circuit.trigger(ActorId::new("earl")).await;
        assert!(report.newly_triggered);
        assert!(matches!(report.record, ChannelOutcome::Failed { .. }));
        assert!(f.circuit.is_halted());
        assert!(f.circuit.has_pending_record().await);

        let work = EnvelopeDraft::new(
            EventKind::Task {
                branch: Branch::Executive,
                verb: TaskVerb::Authorized,
            },
            ActorId::new("earl"),
            json!({ "task_id": "t-9" }),
        );
        assert!(f.ledger.append(work).await.is_err());

        f.storage.set_unavailable(false);
        let retry = f.circuit.trigger(ActorId::new("earl")).await;
        assert!(!retry.newly_triggered);
        assert_eq!(retry.record, ChannelOutcome::Delivered);
        assert!(!f.circuit.has_pending_record().await);
        assert_eq!(halt_records(&f.ledger).await, vec!["halt.circuit.triggered"]);
    }

    #[tokio::test]
    async fn release_needs_the_trigger_recorded() {
        let f = fixture().await;
        assert_eq!(
            f.circuit.release(ActorId::new("earl")).await,
            Err(HaltError::NotHalted)
        );

        f.storage.set_unavailable(true);
        f.circuit.trigger(ActorId::new("earl")).await;
        assert_eq!(
            f.circuit.release(ActorId::new("earl")).await,
            Err(HaltError::RecordPending { epoch: 1 })
        );
        assert!(f.circuit.is_halted());

        f.storage.set_unavailable(false);
        assert_eq!(f.circuit.release(ActorId::new("earl")).await, Ok(1));
        assert!(!f.circuit.is_halted());
        assert_eq!(
            halt_records(&f.ledger).await,
            vec!["halt.circuit.triggered", "halt.circuit.released"]
        );
        assert!(!f.ledger.halt_status().await.active);

        let next = f.circuit.trigger(ActorId::new("earl")).await;
        assert_eq!(next.epoch, 2);
    }

    #[tokio::test]
    async fn reused_episode_is_not_reported_as_recorded() {
        let f = fixture().await;
        f.circuit.trigger(ActorId::new("earl")).await;
        f.circuit.release(ActorId::new("earl")).await.unwrap();

        // A circuit whose counter starts over collides with episode 1.
        let stale = HaltCircuit::new(
            HaltFlag::new(),
            Arc::new(SystemClock),
            Arc::new(f.broadcaster.clone()),
            Arc::new(f.ledger.clone()),
            HaltConfig::default(),
        );
        let report = stale.trigger(ActorId::new("earl")).await;
        assert_eq!(report.epoch, 1);
        assert!(matches!(report.record, ChannelOutcome::Failed { .. }));
        assert!(stale.has_pending_record().await);
        assert_eq!(halt_records(&f.ledger).await.len(), 2);
        assert!(!f.ledger.halt_status().await.active);
    }

    struct StalledRecorder;

    #[async_trait]
    impl HaltRecorder for StalledRecorder {
        async fn record_trigger(&self, _signal: &HaltSignal) -> Result<(), HaltError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn record_release(&self, _epoch: u64, _by: &ActorId) -> Result<(), HaltError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_record_times_out_without_delaying_the_flag() {
        let flag = HaltFlag::new();
        let circuit = HaltCircuit::new(
            flag.clone(),
            Arc::new(SystemClock),
            Arc::new(ChannelBroadcaster::new(1)),
            Arc::new(StalledRecorder),
            HaltConfig {
                record_timeout_ms: 20,
                ..HaltConfig::default()
            },
        );
        let observer = flag.clone();
        let trigger = tokio::spawn(async move { circuit.trigger(ActorId::new("earl")).await });
        tokio::task::yield_now().await;

        let report = trigger.await.unwrap();
        assert!(observer.is_halted());
        assert_eq!(report.record, ChannelOutcome::TimedOut);
        assert!(matches!(report.broadcast, ChannelOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn broadcast_halts_are_adopted_without_echo() {
        let origin = fixture().await;
        let remote_flag = HaltFlag::new();
        let remote = Arc::new(HaltCircuit::new(
            remote_flag.clone(),
            Arc::new(SystemClock),
            Arc::new(ChannelBroadcaster::new(1)),
            Arc::new(StalledRecorder),
            HaltConfig::default(),
        ));
        let (stop, shutdown) = watch::channel(false);
        let follower = {
            let remote = remote.clone();
            let signals = origin.broadcaster.subscribe();
            tokio::spawn(async move { remote.follow(signals, shutdown).await })
        };

        origin.circuit.trigger(ActorId::new("earl")).await;
        for _ in 0..100 {
            if remote_flag.is_halted() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(remote_flag.is_halted());
        assert_eq!(remote_flag.epoch(), 1);
        assert!(!remote.has_pending_record().await);

        stop.send(true).unwrap();
        follower.await.unwrap();
    }

    #[tokio::test]
    async fn open_task_lands_in_quarantine_and_cannot_complete() {
        let f = fixture().await;
        walk(
            &f.ledger,
            "T1",
            &[
                TaskVerb::Authorized,
                TaskVerb::Activated,
                TaskVerb::Routed,
                TaskVerb::Accepted,
            ],
        )
        .await;
        let engine = ProjectionEngine::new(f.ledger.clone());
        engine.catch_up().await.unwrap();

        f.circuit.trigger(ActorId::new("earl")).await;
        engine.catch_up().await.unwrap();
        let task = engine.task(&TaskId::new("T1")).await.unwrap();
        assert_eq!(task.current_state, TaskState::Quarantined);

        f.circuit.release(ActorId::new("earl")).await.unwrap();
        let complete = EnvelopeDraft::new(
            EventKind::Task {
                branch: Branch::Executive,
                verb: TaskVerb::Completed,
            },
            ActorId::new("earl"),
            json!({ "task_id": "T1" }),
        );
        assert!(matches!(
            f.ledger.append(complete).await,
            Err(conclave_kernel_ledger::AppendError::IllegalTransition { .. })
        ));
    }
}
