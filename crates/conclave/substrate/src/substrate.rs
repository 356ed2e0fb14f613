use std::sync::Arc;
use std::time::Duration;

use conclave_kernel_chain::{ChainSummary, Envelope, EnvelopeDraft};
use conclave_kernel_halt::{ChannelBroadcaster, HaltCircuit, HaltReport};
use conclave_kernel_ledger::{IntegrityFault, LedgerOptions, LedgerStore, WalStorage};
use conclave_kernel_lifecycle::{HaltStatus, TaskRecord, ViolationDensity};
use conclave_kernel_merkle::{InclusionProof, MerkleService};
use conclave_kernel_projection::{ProjectionEngine, ProjectionName, ProjectionState};
use conclave_kernel_safety::{CoercionFilter, FilterGateway, TermFilter};
use conclave_kernel_witness::Witness;
use conclave_types::{ActorId, Clock, EventId, HaltFlag, SystemClock, TaskId};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SubstrateConfig;
use crate::error::SubstrateError;
use crate::monitor::LegitimacyMonitor;
use crate::sweeper::TimeoutSweeper;

/// Collaborators the configuration cannot describe.
#[derive(Clone)]
pub struct SubstrateOptions {
    pub clock: Arc<dyn Clock>,
    /// Overrides the configured term filter.
    pub filter: Option<Arc<dyn CoercionFilter>>,
    /// Overrides the configured density policy.
    pub density: Option<Arc<dyn ViolationDensity>>,
    /// Overrides the storage `ledger.data_dir` names.
    pub storage: Option<Arc<dyn WalStorage>>,
}

impl Default for SubstrateOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            filter: None,
            density: None,
            storage: None,
        }
    }
}

/// A point-in-time summary for health checks.
#[derive(Clone, Debug, Serialize)]
pub struct SubstrateHealth {
    pub halted: bool,
    pub halt_epoch: u64,
    pub ledger_halt: HaltStatus,
    pub latest_sequence: Option<u64>,
    pub integrity_fault: Option<IntegrityFault>,
}

/// The wired substrate: one halt flag shared by every I/O path, one ledger,
/// and the derived services around it.
pub struct Substrate {
    config: SubstrateConfig,
    flag: HaltFlag,
    ledger: LedgerStore,
    projections: Arc<ProjectionEngine>,
    merkle: Arc<MerkleService>,
    broadcaster: ChannelBroadcaster,
    halt: Arc<HaltCircuit>,
    witness: Arc<Witness>,
    gateway: FilterGateway,
    sweeper: Arc<TimeoutSweeper>,
    monitor: Arc<LegitimacyMonitor>,
}

impl Substrate {
    pub async fn open(config: SubstrateConfig) -> Result<Self, SubstrateError> {
        Self::open_with(config, SubstrateOptions::default()).await
    }

    pub async fn open_with(
        config: SubstrateConfig,
        options: SubstrateOptions,
    ) -> Result<Self, SubstrateError> {
        let flag = HaltFlag::new();
        let ledger_options = LedgerOptions {
            flag: flag.clone(),
            clock: options.clock.clone(),
            registry: config.actors.registry(),
        };
        let ledger = match options.storage {
            Some(storage) => LedgerStore::open(config.ledger.clone(), storage, ledger_options).await?,
            None => LedgerStore::open_configured(config.ledger.clone(), ledger_options).await?,
        };

        // Episodes continue from the ledger. One never released is still in force.
        let recorded = ledger.halt_status().await;
        if recorded.active {
            if flag.adopt(recorded.epoch) {
                warn!(epoch = recorded.epoch, "Ledger shows an unreleased halt; halt flag raised");
            }
        } else if recorded.epoch > 0 {
            flag.advance_epoch(recorded.epoch);
            debug!(epoch = recorded.epoch, "Halt episode counter resumed from ledger");
        }

        let projections = Arc::new(ProjectionEngine::new(ledger.clone()));
        if let Err(e) = projections.catch_up().await {
            warn!(error = %e, "Initial projection catch-up failed");
        }

        let broadcaster = ChannelBroadcaster::new(config.halt.broadcast_capacity);
        let halt = Arc::new(HaltCircuit::new(
            flag.clone(),
            options.clock.clone(),
            Arc::new(broadcaster.clone()),
            Arc::new(ledger.clone()),
            config.halt.clone(),
        ));

        let filter = options
            .filter
            .unwrap_or_else(|| Arc::new(TermFilter::new(config.filter.clone())));
        let density = options
            .density
            .unwrap_or_else(|| Arc::new(config.legitimacy.policy()));

        let substrate = Self {
            merkle: Arc::new(MerkleService::new(ledger.clone(), config.merkle.clone())),
            witness: Arc::new(Witness::new(ledger.clone())),
            gateway: FilterGateway::new(ledger.clone(), filter),
            sweeper: Arc::new(TimeoutSweeper::new(
                ledger.clone(),
                projections.clone(),
                config.timeouts.policy(),
            )),
            monitor: Arc::new(LegitimacyMonitor::new(ledger.clone(), projections.clone(), density)),
            config,
            flag,
            ledger,
            projections,
            broadcaster,
            halt,
        };
        info!(
            latest_sequence = ?substrate.ledger.latest_sequence().await,
            halted = substrate.flag.is_halted(),
            "Substrate opened"
        );
        Ok(substrate)
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn flag(&self) -> &HaltFlag {
        &self.flag
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn projections(&self) -> &Arc<ProjectionEngine> {
        &self.projections
    }

    pub fn merkle(&self) -> &Arc<MerkleService> {
        &self.merkle
    }

    pub fn halt_circuit(&self) -> &Arc<HaltCircuit> {
        &self.halt
    }

    pub fn broadcaster(&self) -> &ChannelBroadcaster {
        &self.broadcaster
    }

    pub fn witness(&self) -> &Arc<Witness> {
        &self.witness
    }

    pub fn gateway(&self) -> &FilterGateway {
        &self.gateway
    }

    pub fn sweeper(&self) -> &Arc<TimeoutSweeper> {
        &self.sweeper
    }

    pub fn monitor(&self) -> &Arc<LegitimacyMonitor> {
        &self.monitor
    }

    pub async fn append(&self, draft: EnvelopeDraft) -> Result<Envelope, SubstrateError> {
        Ok(self.ledger.append(draft).await?)
    }

    pub async fn trigger_halt(&self, actor: ActorId) -> HaltReport {
        self.halt.trigger(actor).await
    }

    pub async fn release_halt(&self, actor: ActorId) -> Result<u64, SubstrateError> {
        Ok(self.halt.release(actor).await?)
    }

    /// Task view, caught up to the tail first.
    pub async fn task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, SubstrateError> {
        self.projections.catch_up().await?;
        Ok(self.projections.task(task_id).await)
    }

    pub async fn prove(&self, event_id: &EventId) -> Result<InclusionProof, SubstrateError> {
        Ok(self.merkle.prove(event_id).await?)
    }

    pub async fn export(&self) -> Result<Vec<Envelope>, SubstrateError> {
        Ok(self.ledger.export().await?)
    }

    pub async fn verify(&self) -> Result<ChainSummary, SubstrateError> {
        Ok(self.ledger.verify().await?)
    }

    pub async fn rebuild(&self, name: ProjectionName) -> Result<ProjectionState, SubstrateError> {
        Ok(self.projections.rebuild(name).await?)
    }

    pub async fn clear_integrity_lock(&self, operator: &ActorId) -> Result<Envelope, SubstrateError> {
        let envelope = self.ledger.clear_integrity_lock(operator).await?;
        self.projections.rebuild_all().await?;
        Ok(envelope)
    }

    pub async fn health(&self) -> SubstrateHealth {
        SubstrateHealth {
            halted: self.flag.is_halted(),
            halt_epoch: self.flag.epoch(),
            ledger_halt: self.ledger.halt_status().await,
            latest_sequence: self.ledger.latest_sequence().await,
            integrity_fault: self.ledger.integrity_fault().await,
        }
    }

    /// Start every background loop. They stop when `shutdown` flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> SubstrateTasks {
        let mut handles = Vec::new();

        let projections = self.projections.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { projections.run_continuous(rx).await }));

        let projections = self.projections.clone();
        let rx = shutdown.clone();
        let drift_interval = secs(self.config.projection.drift_check_interval_secs);
        handles.push(tokio::spawn(async move {
            projections.run_periodic(drift_interval, rx).await
        }));

        let merkle = self.merkle.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { merkle.run(rx).await }));

        let witness = self.witness.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { witness.run(rx).await }));

        let halt = self.halt.clone();
        let signals = self.broadcaster.subscribe();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { halt.follow(signals, rx).await }));

        let sweeper = self.sweeper.clone();
        let rx = shutdown.clone();
        let sweep_interval = secs(self.config.timeouts.sweep_interval_secs);
        handles.push(tokio::spawn(async move { sweeper.run(sweep_interval, rx).await }));

        let monitor = self.monitor.clone();
        let evaluate_interval = secs(self.config.legitimacy.evaluate_interval_secs);
        handles.push(tokio::spawn(async move {
            monitor.run(evaluate_interval, shutdown).await
        }));

        info!(loops = handles.len(), "Substrate loops started");
        SubstrateTasks { handles }
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

/// Handles of the loops started by [`Substrate::spawn`].
pub struct SubstrateTasks {
    handles: Vec<JoinHandle<()>>,
}

impl SubstrateTasks {
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Substrate loop ended abnormally");
            }
        }
    }
}
