use conclave_kernel_ledger::LedgerStore;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::error::WitnessError;
use crate::finding::{Finding, FindingKey};
use crate::observer::WitnessState;

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub envelopes_read: u64,
    pub recorded: Vec<FindingKey>,
    /// Findings that could not be recorded yet.
    pub pending: usize,
}

struct Inner {
    state: WitnessState,
    pending: Vec<Finding>,
}

impl Inner {
    fn queue(&mut self, finding: Finding) {
        let key = finding.key();
        if self.state.is_recorded(&key) || self.pending.iter().any(|f| f.key() == key) {
            return;
        }
        warn!(finding = ?finding, "Witness finding");
        self.pending.push(finding);
    }
}

/// The witness observer.
///
/// Reads the ledger behind the same notices the projections use, and
/// writes what it finds back into the ledger as `witness.*` events. It
/// never rejects anything and never touches a projection.
pub struct Witness {
    ledger: LedgerStore,
    inner: Mutex<Inner>,
}

impl Witness {
    pub fn new(ledger: LedgerStore) -> Self {
        Self {
            ledger,
            inner: Mutex::new(Inner {
                state: WitnessState::new(),
                pending: Vec::new(),
            }),
        }
    }

    pub async fn expected_next_sequence(&self) -> u64 {
        self.inner.lock().await.state.expected_next_sequence()
    }

    pub async fn pending(&self) -> Vec<Finding> {
        self.inner.lock().await.pending.clone()
    }

    /// Read the ledger to its tail, then record what was found. Findings
    /// already in the ledger are not recorded again.
    pub async fn sweep(&self) -> Result<SweepReport, WitnessError> {
        let mut inner = self.inner.lock().await;
        let mut report = SweepReport::default();

        let mut events = self.ledger.read_events(inner.state.expected_next_sequence());
        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            report.envelopes_read += 1;
            for finding in inner.state.observe(&envelope) {
                inner.queue(finding);
            }
        }
        // Records made by an earlier run are only known once read.
        let Inner { state, pending } = &mut *inner;
        pending.retain(|f| !state.is_recorded(&f.key()));

        report.recorded = self.record_pending(&mut inner).await;
        report.pending = inner.pending.len();
        Ok(report)
    }

    async fn record_pending(&self, inner: &mut Inner) -> Vec<FindingKey> {
        let mut recorded = Vec::new();
        let mut kept = Vec::new();
        for finding in std::mem::take(&mut inner.pending) {
            let key = finding.key();
            let draft = match finding.to_draft() {
                Ok(draft) => draft,
                Err(e) => {
                    error!(finding = ?finding, error = %e, "Witness finding not serializable");
                    continue;
                }
            };
            match self.ledger.append(draft).await {
                Ok(envelope) => {
                    debug!(sequence = envelope.sequence, event_type = %envelope.event_type, "Witness finding recorded");
                    inner.state.mark_recorded(key);
                    recorded.push(key);
                }
                Err(e) => {
                    error!(finding = ?finding, error = %e, "Witness finding not recorded; will retry");
                    kept.push(finding);
                }
            }
        }
        inner.pending = kept;
        recorded
    }

    /// Handle a ledger notice, then sweep.
    pub async fn on_notice(&self, sequence: u64) -> Result<SweepReport, WitnessError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(finding) = inner.state.observe_notice(sequence) {
                inner.queue(finding);
            }
        }
        self.sweep().await
    }

    /// Follow ledger notices until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (subscription, mut notices) = self.ledger.subscribe().await;
        let next = self.ledger.tail().await.next_sequence;
        self.inner.lock().await.state.expect_notices_from(next);
        if let Err(e) = self.sweep().await {
            warn!(error = %e, "Initial witness sweep failed");
        }
        loop {
            tokio::select! {
                notice = notices.recv() => {
                    let Some(notice) = notice else { break };
                    if let Err(e) = self.on_notice(notice.sequence).await {
                        warn!(error = %e, "Witness sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.ledger.unsubscribe(subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{GapSource, ViolationKind};
    use conclave_kernel_chain::EnvelopeDraft;
    use conclave_kernel_ledger::{LedgerConfig, LedgerOptions, MemoryStorage};
    use conclave_types::{ActorId, Branch, EventKind, HaltVerb, TaskVerb};
    use serde_json::json;
    use std::sync::Arc;

    fn authorize(task: &str) -> EnvelopeDraft {
        EnvelopeDraft::new(
            EventKind::Task {
                branch: Branch::Administrative,
                verb: TaskVerb::Authorized,
            },
            ActorId::new("earl"),
            json!({ "task_id": task }),
        )
    }

    async fn witness_records(ledger: &LedgerStore) -> Vec<String> {
        ledger
            .export()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type.starts_with("witness."))
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn quiet_ledger_records_nothing() {
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap();
        ledger.append(authorize("t-1")).await.unwrap();
        let witness = Witness::new(ledger.clone());

        let report = witness.sweep().await.unwrap();
        assert_eq!(report.envelopes_read, 2);
        assert!(report.recorded.is_empty());
        assert_eq!(witness.expected_next_sequence().await, 2);
        assert!(witness_records(&ledger).await.is_empty());
    }

    #[tokio::test]
    async fn work_recorded_during_a_halt_is_witnessed_once() {
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap();
        let epoch = ledger.halt_flag().raise().unwrap();
        ledger
            .append(EnvelopeDraft::new(
                EventKind::Halt(HaltVerb::Triggered),
                ActorId::halt_circuit(),
                json!({ "epoch": epoch }),
            ))
            .await
            .unwrap();
        // A process that lost its flag keeps writing.
        ledger.halt_flag().lower();
        let stray = ledger.append(authorize("t-stray")).await.unwrap();

        let witness = Witness::new(ledger.clone());
        let report = witness.sweep().await.unwrap();
        assert_eq!(
            report.recorded,
            vec![FindingKey::Violation(ViolationKind::WorkAfterHalt, stray.sequence)]
        );
        assert!(witness.sweep().await.unwrap().recorded.is_empty());

        // A fresh witness reads the earlier record and stays quiet.
        let restarted = Witness::new(ledger.clone());
        assert!(restarted.sweep().await.unwrap().recorded.is_empty());
        assert_eq!(
            witness_records(&ledger).await,
            vec!["witness.chain.violation_detected"]
        );
    }

    #[tokio::test]
    async fn lost_notices_are_recorded_as_gaps() {
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap();
        let witness = Witness::new(ledger.clone());
        witness.inner.lock().await.state.expect_notices_from(1);
        for i in 0..3 {
            ledger.append(authorize(&format!("t-{i}"))).await.unwrap();
        }

        witness.on_notice(1).await.unwrap();
        let report = witness.on_notice(3).await.unwrap();
        assert_eq!(report.recorded, vec![FindingKey::Gap(GapSource::Notification, 3)]);

        let record = ledger.export().await.unwrap().pop().unwrap();
        assert_eq!(record.event_type, "witness.sequence.gap_detected");
        assert_eq!(record.actor_id, ActorId::witness());
        assert_eq!(record.payload["source"], "notification");
        assert_eq!(record.payload["expected_sequence"], 2);
    }

    #[tokio::test]
    async fn unrecordable_findings_wait_for_the_ledger() {
        let storage = MemoryStorage::new();
        let ledger = LedgerStore::open(
            LedgerConfig::in_memory(),
            Arc::new(storage.clone()),
            LedgerOptions::default(),
        )
        .await
        .unwrap();
        let witness = Witness::new(ledger.clone());
        witness.inner.lock().await.state.expect_notices_from(1);
        witness.sweep().await.unwrap();

        storage.set_unavailable(true);
        let report = witness.on_notice(4).await.unwrap();
        assert!(report.recorded.is_empty());
        assert_eq!(report.pending, 1);

        storage.set_unavailable(false);
        let report = witness.sweep().await.unwrap();
        assert_eq!(report.recorded, vec![FindingKey::Gap(GapSource::Notification, 4)]);
        assert!(witness.pending().await.is_empty());
    }
}
