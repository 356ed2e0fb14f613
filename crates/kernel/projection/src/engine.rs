use std::time::Duration;

use conclave_kernel_chain::{verify_chain, Digest, Envelope};
use conclave_kernel_ledger::LedgerStore;
use conclave_kernel_lifecycle::{Anomaly, BandRecord, HaltStatus, TaskRecord};
use conclave_types::{EntityId, TaskId};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ProjectionError;
use crate::state::{ProjectionName, ProjectionState, Views};

/// Outcome of a periodic recomputation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub name: ProjectionName,
    pub through_sequence: Option<u64>,
    pub live_digest: Digest,
    pub recomputed_digest: Digest,
}

impl DriftReport {
    pub fn drifted(&self) -> bool {
        self.live_digest != self.recomputed_digest
    }
}

/// Keeps the live views in step with the ledger.
///
/// Readers take the view lock shared; each envelope is folded under the
/// exclusive lock, so a reader sees a view either before or after any one
/// envelope. Catch-up, rebuild and drift checks serialize on `fold_lock`.
pub struct ProjectionEngine {
    ledger: LedgerStore,
    live: RwLock<Views>,
    fold_lock: Mutex<()>,
}

impl ProjectionEngine {
    pub fn new(ledger: LedgerStore) -> Self {
        Self {
            ledger,
            live: RwLock::new(Views::new()),
            fold_lock: Mutex::new(()),
        }
    }

    // ---- Queries ----

    pub async fn task(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.live.read().await.tasks.get(task_id).cloned()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.live.read().await.tasks.tasks().cloned().collect()
    }

    pub async fn band(&self, entity_id: &EntityId) -> Option<BandRecord> {
        self.live.read().await.legitimacy.get(entity_id).cloned()
    }

    pub async fn bands(&self) -> Vec<BandRecord> {
        self.live.read().await.legitimacy.records().cloned().collect()
    }

    pub async fn halt(&self) -> HaltStatus {
        self.live.read().await.tasks.halt()
    }

    pub async fn anomalies(&self) -> Vec<Anomaly> {
        let live = self.live.read().await;
        live.tasks
            .anomalies()
            .iter()
            .chain(live.legitimacy.anomalies())
            .cloned()
            .collect()
    }

    pub async fn state(&self, name: ProjectionName) -> Result<ProjectionState, ProjectionError> {
        self.live.read().await.state(name)
    }

    /// Run `f` against a consistent view of every projection.
    pub async fn with_views<R>(&self, f: impl FnOnce(&Views) -> R) -> R {
        f(&*self.live.read().await)
    }

    // ---- Continuous mode ----

    /// Fold every envelope the live views have not seen yet. Returns how
    /// many envelopes changed some view.
    ///
    /// A view that no longer matches the ledger (after an operator cut the
    /// chain back) is rebuilt from zero.
    pub async fn catch_up(&self) -> Result<u64, ProjectionError> {
        let _fold = self.fold_lock.lock().await;
        match self.fold_new().await {
            Ok(applied) => Ok(applied),
            Err(ProjectionError::Fold(e)) => {
                warn!(error = %e, "Live views diverged from the ledger; rebuilding");
                let fresh = self.fold_from_zero(None, None).await?;
                *self.live.write().await = fresh;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn fold_new(&self) -> Result<u64, ProjectionError> {
        let from = self.live.read().await.next_sequence();
        let mut events = self.ledger.read_events(from);
        let mut applied = 0;
        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            if self.live.write().await.apply(&envelope)? {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(from, applied, "Projections caught up");
        }
        Ok(applied)
    }

    /// Follow ledger notices until `shutdown` flips. Notices are only
    /// wake-ups; content always comes from the ledger.
    pub async fn run_continuous(&self, mut shutdown: watch::Receiver<bool>) {
        let (subscription, mut notices) = self.ledger.subscribe().await;
        if let Err(e) = self.catch_up().await {
            error!(error = %e, "Initial projection catch-up failed");
        }
        info!("Continuous projection started");

        loop {
            tokio::select! {
                notice = notices.recv() => {
                    if notice.is_none() {
                        break;
                    }
                    while notices.try_recv().is_ok() {}
                    if let Err(e) = self.catch_up().await {
                        error!(error = %e, "Projection catch-up failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.ledger.unsubscribe(subscription).await;
        info!("Continuous projection stopped");
    }

    // ---- Manual mode ----

    /// Fold the named view from sequence 0 and swap it in.
    pub async fn rebuild(&self, name: ProjectionName) -> Result<ProjectionState, ProjectionError> {
        let _fold = self.fold_lock.lock().await;
        let fresh = self.fold_from_zero(Some(name), None).await?;
        let mut live = self.live.write().await;
        live.replace(name, fresh);
        let state = live.state(name)?;
        info!(
            projection = %name,
            through = ?state.last_applied_sequence,
            digest = %state.digest,
            "Projection rebuilt"
        );
        Ok(state)
    }

    pub async fn rebuild_all(&self) -> Result<(), ProjectionError> {
        let _fold = self.fold_lock.lock().await;
        let fresh = self.fold_from_zero(None, None).await?;
        *self.live.write().await = fresh;
        info!("All projections rebuilt");
        Ok(())
    }

    /// Fold the ledger from genesis, into `only` that view or into all.
    async fn fold_from_zero(
        &self,
        only: Option<ProjectionName>,
        through: Option<u64>,
    ) -> Result<Views, ProjectionError> {
        let mut views = Views::new();
        let mut events = self.ledger.read_events(0);
        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            if through.is_some_and(|last| envelope.sequence > last) {
                break;
            }
            match only {
                Some(name) => {
                    views.apply_to(name, &envelope)?;
                }
                None => {
                    views.apply(&envelope)?;
                }
            }
        }
        Ok(views)
    }

    // ---- Periodic mode ----

    /// Recompute the named view up to the live cursor and compare digests.
    pub async fn check_drift(&self, name: ProjectionName) -> Result<DriftReport, ProjectionError> {
        let _fold = self.fold_lock.lock().await;
        let live = self.live.read().await.state(name)?;
        let recomputed = match live.last_applied_sequence {
            Some(through) => self
                .fold_from_zero(Some(name), Some(through))
                .await?
                .state(name)?,
            None => Views::new().state(name)?,
        };
        Ok(DriftReport {
            name,
            through_sequence: live.last_applied_sequence,
            live_digest: live.digest,
            recomputed_digest: recomputed.digest,
        })
    }

    /// Check every view each `interval`; a drifted view is logged and
    /// rebuilt.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for name in ProjectionName::ALL {
                        match self.check_drift(name).await {
                            Ok(report) if report.drifted() => {
                                error!(
                                    projection = %name,
                                    through = ?report.through_sequence,
                                    live = %report.live_digest,
                                    recomputed = %report.recomputed_digest,
                                    "Projection drift detected"
                                );
                                if let Err(e) = self.rebuild(name).await {
                                    error!(projection = %name, error = %e, "Drift repair failed");
                                }
                            }
                            Ok(_) => debug!(projection = %name, "No projection drift"),
                            Err(e) => warn!(projection = %name, error = %e, "Drift check failed"),
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_for_test(&self, f: impl FnOnce(&mut Views)) {
        f(&mut *self.live.write().await)
    }
}

/// Fold an exported ledger with no store at all. The export is verified
/// first; a broken chain is refused.
pub fn rebuild_from_export(envelopes: &[Envelope]) -> Result<Vec<ProjectionState>, ProjectionError> {
    verify_chain(envelopes)?;
    let mut views = Views::new();
    for envelope in envelopes {
        views.apply(envelope)?;
    }
    ProjectionName::ALL
        .into_iter()
        .map(|name| views.state(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_kernel_chain::EnvelopeDraft;
    use conclave_kernel_ledger::{LedgerConfig, LedgerOptions};
    use conclave_kernel_lifecycle::{Fold, LegitimacyBand, LegitimacyBoard, TaskBoard, TaskState};
    use conclave_types::{ActorId, Branch, EventKind, HaltVerb, LegitimacyVerb, TaskVerb};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn ledger() -> LedgerStore {
        LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap()
    }

    async fn walk(ledger: &LedgerStore, task: &str, verbs: &[TaskVerb]) {
        for verb in verbs {
            let mut payload = json!({ "task_id": task });
            if *verb == TaskVerb::Routed {
                payload["cluster_id"] = json!("cluster-a");
            }
            let kind = EventKind::Task {
                branch: Branch::Judicial,
                verb: *verb,
            };
            ledger
                .append(EnvelopeDraft::new(kind, ActorId::new("earl"), payload))
                .await
                .unwrap();
        }
    }

    const TO_ACCEPTED: [TaskVerb; 4] = [
        TaskVerb::Authorized,
        TaskVerb::Activated,
        TaskVerb::Routed,
        TaskVerb::Accepted,
    ];

    #[tokio::test]
    async fn catch_up_folds_new_envelopes_once() {
        let ledger = ledger().await;
        let engine = ProjectionEngine::new(ledger.clone());
        walk(&ledger, "t-1", &TO_ACCEPTED).await;

        assert_eq!(engine.catch_up().await.unwrap(), 5);
        assert_eq!(engine.catch_up().await.unwrap(), 0);
        let task = engine.task(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(task.current_state, TaskState::Accepted);
        assert_eq!(task.last_event_sequence, 4);
    }

    #[tokio::test]
    async fn reapplying_an_envelope_changes_nothing() {
        let ledger = ledger().await;
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        let chain = ledger.export().await.unwrap();

        let mut views = Views::new();
        for envelope in &chain {
            views.apply(envelope).unwrap();
        }
        let before = views.state(ProjectionName::Tasks).unwrap();
        for envelope in &chain {
            assert!(!views.apply(envelope).unwrap());
        }
        assert_eq!(views.state(ProjectionName::Tasks).unwrap(), before);
    }

    #[tokio::test]
    async fn rebuild_matches_continuous_state() {
        let ledger = ledger().await;
        let engine = ProjectionEngine::new(ledger.clone());
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        engine.catch_up().await.unwrap();
        walk(&ledger, "t-2", &TO_ACCEPTED[..2]).await;
        engine.catch_up().await.unwrap();

        let live = engine.state(ProjectionName::Tasks).await.unwrap();
        let rebuilt = engine.rebuild(ProjectionName::Tasks).await.unwrap();
        assert_eq!(live, rebuilt);
    }

    #[tokio::test]
    async fn drift_is_detected_and_repaired() {
        let ledger = ledger().await;
        let engine = ProjectionEngine::new(ledger.clone());
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        engine.catch_up().await.unwrap();
        assert!(!engine.check_drift(ProjectionName::Tasks).await.unwrap().drifted());

        engine
            .corrupt_for_test(|views| {
                let mut snapshot = views.tasks.snapshot();
                if let Some(record) = snapshot.tasks.values_mut().next() {
                    record.current_state = TaskState::Completed;
                }
                views.tasks = TaskBoard::from_snapshot(snapshot);
            })
            .await;
        let report = engine.check_drift(ProjectionName::Tasks).await.unwrap();
        assert!(report.drifted());
        assert_eq!(report.through_sequence, Some(4));

        engine.rebuild(ProjectionName::Tasks).await.unwrap();
        assert!(!engine.check_drift(ProjectionName::Tasks).await.unwrap().drifted());
        let task = engine.task(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(task.current_state, TaskState::Accepted);
    }

    #[tokio::test]
    async fn rebuilding_one_view_leaves_the_other_alone() {
        let ledger = ledger().await;
        let engine = ProjectionEngine::new(ledger.clone());
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        engine.catch_up().await.unwrap();

        engine
            .corrupt_for_test(|views| {
                views.tasks = TaskBoard::new();
                views.legitimacy = LegitimacyBoard::new();
            })
            .await;
        let rebuilt = engine.rebuild(ProjectionName::Tasks).await.unwrap();
        assert_eq!(rebuilt.last_applied_sequence, Some(4));
        assert!(engine
            .with_views(|views| views.legitimacy.cursor())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn export_rebuilds_identically_offline() {
        let ledger = ledger().await;
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        ledger
            .append(EnvelopeDraft::new(
                EventKind::Legitimacy(LegitimacyVerb::Registered),
                ActorId::new("registrar"),
                json!({ "entity_id": "cluster-a" }),
            ))
            .await
            .unwrap();
        let export = ledger.export().await.unwrap();

        let first = rebuild_from_export(&export).unwrap();
        let second = rebuild_from_export(&export).unwrap();
        assert_eq!(first, second);

        let engine = ProjectionEngine::new(ledger.clone());
        engine.catch_up().await.unwrap();
        for state in &first {
            assert_eq!(engine.state(state.name).await.unwrap().digest, state.digest);
        }
        assert_eq!(
            engine.band(&EntityId::new("cluster-a")).await.unwrap().current_band,
            LegitimacyBand::Stable
        );
    }

    #[tokio::test]
    async fn tampered_export_is_refused() {
        let ledger = ledger().await;
        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        let mut export = ledger.export().await.unwrap();
        export[2].payload["task_id"] = json!("t-other");
        assert!(matches!(
            rebuild_from_export(&export),
            Err(ProjectionError::Chain(_))
        ));
    }

    #[tokio::test]
    async fn continuous_mode_follows_notices() {
        let ledger = ledger().await;
        let engine = Arc::new(ProjectionEngine::new(ledger.clone()));
        let (stop, shutdown) = watch::channel(false);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_continuous(shutdown).await })
        };

        walk(&ledger, "t-1", &TO_ACCEPTED).await;
        let mut state = None;
        for _ in 0..100 {
            state = engine.task(&TaskId::new("t-1")).await.map(|t| t.current_state);
            if state == Some(TaskState::Accepted) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(TaskState::Accepted));

        stop.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn readers_see_halt_migration_whole() {
        let ledger = ledger().await;
        for i in 0..50 {
            let task = format!("t-{i}");
            let depth = 1 + i % TO_ACCEPTED.len();
            walk(&ledger, &task, &TO_ACCEPTED[..depth]).await;
        }
        let engine = ProjectionEngine::new(ledger.clone());
        engine.catch_up().await.unwrap();

        let epoch = ledger.halt_flag().raise().unwrap();
        ledger
            .append(EnvelopeDraft::new(
                EventKind::Halt(HaltVerb::Triggered),
                ActorId::halt_circuit(),
                json!({ "epoch": epoch }),
            ))
            .await
            .unwrap();
        engine.catch_up().await.unwrap();

        assert!(engine.halt().await.active);
        for task in engine.tasks().await {
            assert!(
                matches!(task.current_state, TaskState::Nullified | TaskState::Quarantined),
                "{} left in {:?}",
                task.task_id,
                task.current_state
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn rebuild_is_deterministic(depths in proptest::collection::vec(1usize..=4, 1..8)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let export = rt.block_on(async {
                let ledger = ledger().await;
                for (i, depth) in depths.iter().enumerate() {
                    walk(&ledger, &format!("t-{i}"), &TO_ACCEPTED[..*depth]).await;
                }
                ledger.export().await.unwrap()
            });
            let a = rebuild_from_export(&export).unwrap();
            let b = rebuild_from_export(&export).unwrap();
            prop_assert_eq!(
                serde_json::to_vec(&a).unwrap(),
                serde_json::to_vec(&b).unwrap()
            );
        }
    }
}
