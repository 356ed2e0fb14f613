use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use conclave_kernel_chain::{Digest, EnvelopeDraft};
use conclave_kernel_ledger::{AppendError, LedgerStore};
use conclave_types::{ActorId, EventId, EventKind};
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::accumulator::{MerkleAccumulator, MerkleConfig, SealRecord};
use crate::error::MerkleError;
use crate::proof::InclusionProof;

struct ServiceState {
    accumulator: MerkleAccumulator,
    /// Roots already recorded in the ledger, by epoch.
    published: BTreeMap<u64, Digest>,
    /// Sealed here but not yet recorded.
    unpublished: BTreeSet<u64>,
}

/// Drives a [`MerkleAccumulator`] from the ledger and records each sealed
/// root as `merkle.epoch.sealed`, exactly once per epoch.
pub struct MerkleService {
    ledger: LedgerStore,
    config: MerkleConfig,
    state: Mutex<ServiceState>,
}

impl MerkleService {
    pub fn new(ledger: LedgerStore, config: MerkleConfig) -> Self {
        Self {
            state: Mutex::new(ServiceState {
                accumulator: MerkleAccumulator::new(config.boundary()),
                published: BTreeMap::new(),
                unpublished: BTreeSet::new(),
            }),
            ledger,
            config,
        }
    }

    /// Read the ledger to its tail, then record every sealed epoch the
    /// ledger does not hold yet. Returns the epochs recorded by this call.
    pub async fn catch_up(&self) -> Result<Vec<u64>, MerkleError> {
        let mut state = self.state.lock().await;
        self.ingest_new(&mut state).await?;
        Ok(self.publish_unpublished(&mut state).await)
    }

    /// Close a window epoch whose time is up.
    pub async fn seal_due(&self) -> Result<Vec<u64>, MerkleError> {
        let mut state = self.state.lock().await;
        self.ingest_new(&mut state).await?;
        let now = self.ledger.clock().now();
        if let Some(epoch) = state.accumulator.seal_pending(now) {
            state.unpublished.insert(epoch);
        }
        Ok(self.publish_unpublished(&mut state).await)
    }

    async fn ingest_new(&self, state: &mut ServiceState) -> Result<(), MerkleError> {
        let mut events = self.ledger.read_events(state.accumulator.next_sequence());
        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            if let Ok(EventKind::MerkleEpochSealed) = envelope.kind() {
                match envelope.payload_as::<SealRecord>() {
                    Ok(record) => self.observe_record(state, record),
                    Err(e) => warn!(sequence = envelope.sequence, error = %e, "Unreadable epoch record"),
                }
            }
            if let Some(epoch) = state.accumulator.ingest(&envelope)? {
                if !state.published.contains_key(&epoch) {
                    state.unpublished.insert(epoch);
                }
            }
        }
        Ok(())
    }

    fn observe_record(&self, state: &mut ServiceState, record: SealRecord) {
        if let Some(sealed) = state.accumulator.epoch(record.epoch) {
            let computed = sealed.root();
            if computed != record.root {
                let mismatch = MerkleError::RootMismatch {
                    epoch: record.epoch,
                    recorded: record.root,
                    computed,
                };
                error!(error = %mismatch, "Recorded epoch root does not match the ledger");
            }
        } else {
            warn!(epoch = record.epoch, "Epoch record found before the epoch closed here");
        }
        state.unpublished.remove(&record.epoch);
        state.published.insert(record.epoch, record.root);
    }

    async fn publish_unpublished(&self, state: &mut ServiceState) -> Vec<u64> {
        let mut recorded = Vec::new();
        let pending: Vec<u64> = state.unpublished.iter().copied().collect();
        for epoch in pending {
            let Some(record) = state.accumulator.epoch(epoch).map(|e| e.record()) else {
                continue;
            };
            match self.publish(&record).await {
                Ok(()) => {
                    info!(epoch, root = %record.root, leaves = record.leaf_count, "Merkle root published");
                    recorded.push(epoch);
                }
                Err(MerkleError::Publish {
                    source: AppendError::DuplicateRecord { .. },
                    ..
                }) => debug!(epoch, "Epoch root already recorded"),
                Err(e) => {
                    warn!(epoch, error = %e, "Merkle root not published; will retry");
                    continue;
                }
            }
            state.unpublished.remove(&epoch);
            state.published.insert(epoch, record.root);
        }
        recorded
    }

    async fn publish(&self, record: &SealRecord) -> Result<(), MerkleError> {
        let draft = EnvelopeDraft::new(
            EventKind::MerkleEpochSealed,
            ActorId::merkle_accumulator(),
            serde_json::to_value(record)?,
        );
        self.ledger
            .append(draft)
            .await
            .map(|_| ())
            .map_err(|source| MerkleError::Publish {
                epoch: record.epoch,
                source,
            })
    }

    /// Proof of inclusion for `event_id`, catching up first if the event is
    /// newer than the accumulator.
    pub async fn prove(&self, event_id: &EventId) -> Result<InclusionProof, MerkleError> {
        match self.state.lock().await.accumulator.prove(event_id) {
            Err(MerkleError::UnknownEvent(_)) => {}
            other => return other,
        }
        self.catch_up().await?;
        self.state.lock().await.accumulator.prove(event_id)
    }

    pub async fn epoch(&self, epoch: u64) -> Option<SealRecord> {
        self.state
            .lock()
            .await
            .accumulator
            .epoch(epoch)
            .map(|e| e.record())
    }

    pub async fn published_root(&self, epoch: u64) -> Option<Digest> {
        self.state.lock().await.published.get(&epoch).copied()
    }

    /// Follow ledger notices and close window epochs on a timer until
    /// `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (subscription, mut notices) = self.ledger.subscribe().await;
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.seal_check_interval_ms.max(1)));
        if let Err(e) = self.catch_up().await {
            warn!(error = %e, "Initial merkle catch-up failed");
        }
        loop {
            tokio::select! {
                notice = notices.recv() => {
                    if notice.is_none() {
                        break;
                    }
                    while notices.try_recv().is_ok() {}
                    if let Err(e) = self.catch_up().await {
                        warn!(error = %e, "Merkle catch-up failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.seal_due().await {
                        warn!(error = %e, "Merkle seal check failed");
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
    use crate::tree;
    use chrono::{TimeZone, Utc};
    use conclave_kernel_ledger::{LedgerConfig, LedgerOptions, MemoryStorage};
    use conclave_types::{Branch, ManualClock, TaskVerb};
    use serde_json::json;
    use std::sync::Arc;

    fn authorize(task: &str) -> EnvelopeDraft {
        EnvelopeDraft::new(
            EventKind::Task {
                branch: Branch::Legislative,
                verb: TaskVerb::Authorized,
            },
            ActorId::new("earl"),
            json!({ "task_id": task }),
        )
    }

    async fn seal_records(ledger: &LedgerStore) -> Vec<SealRecord> {
        ledger
            .export()
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "merkle.epoch.sealed")
            .map(|e| e.payload_as::<SealRecord>().unwrap())
            .collect()
    }

    fn count_config(size: u64) -> MerkleConfig {
        MerkleConfig {
            epoch_size: size,
            ..MerkleConfig::default()
        }
    }

    #[tokio::test]
    async fn sealed_epochs_are_published_once_and_prove_offline() {
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..7 {
            ids.push(ledger.append(authorize(&format!("t-{i}"))).await.unwrap().event_id);
        }
        let service = MerkleService::new(ledger.clone(), count_config(4));
        assert_eq!(service.catch_up().await.unwrap(), vec![0, 1]);
        assert!(service.catch_up().await.unwrap().is_empty());

        let records = seal_records(&ledger).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].first_sequence, 4);

        let proof = service.prove(&ids[4]).await.unwrap();
        assert_eq!(proof.epoch, 1);
        assert!(tree::verify(&proof.event_hash, &proof.merkle_path, &records[1].root));

        let value = serde_json::to_value(&proof).unwrap();
        for key in ["event_id", "event_hash", "merkle_path", "merkle_root", "epoch"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn open_epoch_cannot_be_proven_yet() {
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), LedgerOptions::default())
            .await
            .unwrap();
        let id = ledger.append(authorize("t-1")).await.unwrap().event_id;
        let service = MerkleService::new(ledger, count_config(16));
        assert!(matches!(
            service.prove(&id).await,
            Err(MerkleError::NotYetSealed { epoch: 0, .. })
        ));
        assert!(matches!(
            service.prove(&EventId::new()).await,
            Err(MerkleError::UnknownEvent(_))
        ));
    }

    #[tokio::test]
    async fn restarted_service_never_republishes() {
        let storage = MemoryStorage::new();
        let ledger = LedgerStore::open(
            LedgerConfig::in_memory(),
            Arc::new(storage.clone()),
            LedgerOptions::default(),
        )
        .await
        .unwrap();
        for i in 0..5 {
            ledger.append(authorize(&format!("t-{i}"))).await.unwrap();
        }
        let first = MerkleService::new(ledger.clone(), count_config(3));
        assert_eq!(first.catch_up().await.unwrap(), vec![0, 1]);

        let second = MerkleService::new(ledger.clone(), count_config(3));
        assert!(second.catch_up().await.unwrap().is_empty());
        assert_eq!(second.published_root(0).await, first.published_root(0).await);
        assert_eq!(seal_records(&ledger).await.len(), 2);
    }

    #[tokio::test]
    async fn window_epochs_seal_when_time_passes() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()));
        let options = LedgerOptions {
            clock: clock.clone(),
            ..LedgerOptions::default()
        };
        let ledger = LedgerStore::open_configured(LedgerConfig::in_memory(), options)
            .await
            .unwrap();
        ledger.append(authorize("t-1")).await.unwrap();
        let service = MerkleService::new(
            ledger.clone(),
            MerkleConfig {
                epoch_window_secs: Some(60),
                ..MerkleConfig::default()
            },
        );
        assert!(service.seal_due().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(service.seal_due().await.unwrap(), vec![0]);
        assert_eq!(service.epoch(0).await.unwrap().leaf_count, 2);

        // The next window holds only the epoch record and stays open.
        clock.advance(chrono::Duration::seconds(120));
        assert!(service.seal_due().await.unwrap().is_empty());
    }
}
