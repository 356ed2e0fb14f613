use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use conclave_kernel_chain::{
    link, verify_chain, verify_link, Candidate, ChainSummary, ChainTail, ChainVerifier, Envelope,
    EnvelopeDraft,
};
use conclave_kernel_lifecycle::HaltStatus;
use conclave_types::{ActorId, Clock, EventId, EventKind, HaltFlag, LedgerVerb, SystemClock};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::error::{AppendError, IntegrityFault, LedgerError};
use crate::notify::{SequenceNotice, SequenceNotifier, SubscriptionId};
use crate::registry::ActorRegistry;
use crate::validator::Validator;
use crate::wal::{quarantine_from, FileStorage, MemoryStorage, WalStorage, WalWriteError, WriteAheadLog};

/// Collaborators shared with the rest of the substrate.
#[derive(Clone)]
pub struct LedgerOptions {
    pub flag: HaltFlag,
    pub clock: Arc<dyn Clock>,
    pub registry: ActorRegistry,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            flag: HaltFlag::new(),
            clock: Arc::new(SystemClock),
            registry: ActorRegistry::permissive(),
        }
    }
}

struct WriterState {
    wal: WriteAheadLog,
    validator: Validator,
    tail: ChainTail,
    by_event_id: HashMap<EventId, u64>,
    fault: Option<IntegrityFault>,
}

struct Inner {
    config: LedgerConfig,
    storage: Arc<dyn WalStorage>,
    flag: HaltFlag,
    clock: Arc<dyn Clock>,
    registry: ActorRegistry,
    notifier: SequenceNotifier,
    state: Mutex<WriterState>,
}

/// The single writer of the constitutional ledger.
///
/// Appends are serialized through one lock; each is validated against the
/// current tail, linked, made durable and only then acknowledged. Any
/// failure before the WAL write leaves no trace. A write that may have
/// partially reached storage, or a chain break found on open, locks the
/// store until an operator runs [`LedgerStore::clear_integrity_lock`].
#[derive(Clone)]
pub struct LedgerStore {
    inner: Arc<Inner>,
}

impl LedgerStore {
    /// Open a ledger on `storage`, replaying and verifying every entry.
    /// An empty, healthy ledger gets its genesis event.
    pub async fn open(
        config: LedgerConfig,
        storage: Arc<dyn WalStorage>,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        let state = load(&config, &storage)?;
        match &state.fault {
            Some(fault) => error!(
                fault = %fault,
                valid_entries = state.wal.len(),
                "Ledger opened integrity-locked; appends refused until cleared"
            ),
            None => info!(
                entries = state.wal.len(),
                tail_hash = %state.tail.hash,
                algorithm = config.hash_algorithm.tag(),
                "Ledger opened"
            ),
        }
        let needs_genesis = state.fault.is_none() && state.tail.is_empty();

        let store = Self {
            inner: Arc::new(Inner {
                notifier: SequenceNotifier::new(config.notify_capacity),
                config,
                storage,
                flag: options.flag,
                clock: options.clock,
                registry: options.registry,
                state: Mutex::new(state),
            }),
        };
        if needs_genesis {
            let mut state = store.inner.state.lock().await;
            store.inner.write_genesis(&mut state).await?;
        }
        Ok(store)
    }

    /// Open on the storage `config.data_dir` names, or in memory.
    pub async fn open_configured(
        config: LedgerConfig,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        let storage: Arc<dyn WalStorage> = match &config.data_dir {
            Some(dir) => Arc::new(FileStorage::new(dir.clone())?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::open(config, storage, options).await
    }

    pub async fn open_file(
        data_dir: PathBuf,
        config: LedgerConfig,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        Self::open(config, Arc::new(FileStorage::new(data_dir)?), options).await
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn halt_flag(&self) -> &HaltFlag {
        &self.inner.flag
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Validate, link, persist and publish one event.
    ///
    /// The critical section runs on its own task, so a caller that stops
    /// waiting cannot interrupt an append between the WAL write and the
    /// tail update.
    pub async fn append(&self, draft: EnvelopeDraft) -> Result<Envelope, AppendError> {
        let kind = draft
            .kind()
            .map_err(|e| AppendError::UnknownEventType(e.0))?;
        if !kind.is_halt_exempt() {
            self.inner.flag.check()?;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = inner.state.lock().await;
            inner.commit(&mut state, kind, draft).await
        })
        .await
        .map_err(|e| AppendError::Storage(LedgerError::Task(e.to_string())))?
    }

    /// Up to `limit` envelopes starting at sequence `from`.
    pub async fn read_range(&self, from: u64, limit: usize) -> Result<Vec<Envelope>, LedgerError> {
        let raw = {
            let state = self.inner.state.lock().await;
            state.wal.read_entries(from, limit)?
        };
        raw.into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(LedgerError::from))
            .collect()
    }

    pub async fn get_by_sequence(&self, sequence: u64) -> Result<Option<Envelope>, LedgerError> {
        Ok(self.read_range(sequence, 1).await?.into_iter().next())
    }

    pub async fn get(&self, event_id: &EventId) -> Result<Option<Envelope>, LedgerError> {
        let sequence = {
            let state = self.inner.state.lock().await;
            state.by_event_id.get(event_id).copied()
        };
        match sequence {
            Some(sequence) => self.get_by_sequence(sequence).await,
            None => Ok(None),
        }
    }

    pub async fn tail(&self) -> ChainTail {
        self.inner.state.lock().await.tail
    }

    pub async fn latest_sequence(&self) -> Option<u64> {
        self.tail().await.last_sequence()
    }

    /// Every envelope from `from` to the tail as of each page read.
    pub fn read_events(&self, from: u64) -> BoxStream<'static, Result<Envelope, LedgerError>> {
        let page = self.inner.config.read_page_size.max(1);
        let store = self.clone();
        stream::unfold(Some(from), move |cursor| {
            let store = store.clone();
            async move {
                let next = cursor?;
                match store.read_range(next, page).await {
                    Ok(batch) if batch.is_empty() => None,
                    Ok(batch) => {
                        let following = (batch.len() == page).then_some(next + page as u64);
                        Some((batch.into_iter().map(Ok).collect::<Vec<_>>(), following))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// The whole chain, verified before it is returned. Refused while the
    /// store is integrity-locked.
    pub async fn export(&self) -> Result<Vec<Envelope>, LedgerError> {
        let raw = {
            let state = self.inner.state.lock().await;
            if let Some(fault) = &state.fault {
                return Err(LedgerError::IntegrityLocked(fault.clone()));
            }
            state.wal.read_entries(0, state.wal.len() as usize)?
        };
        let envelopes = raw
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice::<Envelope>(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let summary = verify_chain(&envelopes)?;
        info!(length = summary.length, "Ledger exported");
        Ok(envelopes)
    }

    pub async fn export_json(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string_pretty(&self.export().await?)?)
    }

    /// Re-read and re-verify the readable chain.
    pub async fn verify(&self) -> Result<ChainSummary, LedgerError> {
        let mut verifier = ChainVerifier::new();
        let mut events = self.read_events(0);
        while let Some(envelope) = events.next().await {
            verifier.push(&envelope?)?;
        }
        Ok(verifier.finish())
    }

    pub async fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<SequenceNotice>) {
        self.inner.notifier.subscribe().await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.notifier.unsubscribe(id).await
    }

    pub async fn integrity_fault(&self) -> Option<IntegrityFault> {
        self.inner.state.lock().await.fault.clone()
    }

    pub async fn is_locked(&self) -> bool {
        self.integrity_fault().await.is_some()
    }

    /// Halt status as recorded in the ledger, which may differ from the
    /// in-memory flag after a restart or a failed halt record.
    pub async fn halt_status(&self) -> HaltStatus {
        self.inner.state.lock().await.validator.halt_status()
    }

    /// Flush buffered WAL entries.
    pub async fn sync(&self) -> Result<(), LedgerError> {
        self.inner.state.lock().await.wal.sync()
    }

    /// Operator recovery from an integrity lock.
    ///
    /// Moves every segment from the fault onward aside, keeps the valid
    /// prefix, reloads, and records `ledger.integrity.violated` naming the
    /// fault and the operator. Returns that record.
    pub async fn clear_integrity_lock(&self, operator: &ActorId) -> Result<Envelope, LedgerError> {
        let mut state = self.inner.state.lock().await;
        let Some(fault) = state.fault.clone() else {
            return Err(LedgerError::NotLocked);
        };
        let valid_through = state.tail.last_sequence();

        let new_segment = quarantine_from(&*self.inner.storage, fault.segment_id(), fault.offset())?;
        let fresh = load(&self.inner.config, &self.inner.storage)?;
        if let Some(remaining) = fresh.fault.clone() {
            *state = fresh;
            return Err(LedgerError::IntegrityLocked(remaining));
        }
        *state = fresh;
        warn!(
            operator = %operator,
            fault = %fault,
            valid_through = ?valid_through,
            new_segment,
            "Integrity lock cleared"
        );

        if state.tail.is_empty() {
            self.inner.write_genesis(&mut state).await?;
        }
        let draft = EnvelopeDraft::new(
            EventKind::Ledger(LedgerVerb::IntegrityViolated),
            ActorId::ledger_custodian(),
            json!({
                "fault": fault,
                "cleared_by": operator,
                "valid_through": valid_through,
                "new_segment": new_segment,
            }),
        );
        self.inner
            .commit(&mut state, EventKind::Ledger(LedgerVerb::IntegrityViolated), draft)
            .await
            .map_err(|e| LedgerError::Recovery(e.to_string()))
    }
}

impl Inner {
    async fn write_genesis(&self, state: &mut WriterState) -> Result<Envelope, LedgerError> {
        let draft = EnvelopeDraft::new(
            EventKind::Ledger(LedgerVerb::Genesis),
            ActorId::ledger_custodian(),
            json!({ "hash_algorithm": self.config.hash_algorithm.tag() }),
        );
        let genesis = self
            .commit(state, EventKind::Ledger(LedgerVerb::Genesis), draft)
            .await
            .map_err(|e| LedgerError::Recovery(e.to_string()))?;
        info!(hash = %genesis.hash, "Ledger genesis written");
        Ok(genesis)
    }

    async fn commit(
        &self,
        state: &mut WriterState,
        kind: EventKind,
        draft: EnvelopeDraft,
    ) -> Result<Envelope, AppendError> {
        if let Some(fault) = &state.fault {
            return Err(AppendError::IntegrityLocked(fault.clone()));
        }
        if !kind.is_halt_exempt() {
            self.flag.check()?;
        }
        self.registry.authorize(&draft.actor_id, &kind)?;
        state.validator.check(kind, &draft, state.tail.next_sequence)?;

        let now = self.clock.now();
        let timestamp = match state.tail.timestamp {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let tail = state.tail;
        let envelope = link(
            &tail,
            Candidate {
                draft,
                event_id: EventId::new(),
                timestamp,
            },
            self.config.hash_algorithm,
        )
        .map_err(LedgerError::from)?;

        if let Err(reason) = verify_link(&tail, &envelope) {
            let (segment_id, offset) = state.wal.end_position();
            let fault = IntegrityFault::ChainBreak {
                segment_id,
                offset,
                sequence: envelope.sequence,
                reason: reason.to_string(),
            };
            error!(fault = %fault, "Freshly linked envelope failed verification; locking ledger");
            state.fault = Some(fault);
            return Err(AppendError::HashChainBreak {
                sequence: envelope.sequence,
            });
        }

        let bytes = serde_json::to_vec(&envelope).map_err(LedgerError::from)?;
        let (segment_id, offset) = state.wal.end_position();
        match state.wal.append(envelope.sequence, &bytes) {
            Ok(()) => {}
            Err(WalWriteError::Clean(e)) => {
                warn!(sequence = envelope.sequence, error = %e, "Append failed before any byte was persisted");
                return Err(AppendError::Storage(e));
            }
            Err(WalWriteError::Partial(fault)) => {
                error!(fault = %fault, "Partial write; locking ledger");
                state.fault = Some(fault.clone());
                return Err(AppendError::IntegrityLocked(fault));
            }
        }

        if let Err(e) = state.validator.absorb(&envelope) {
            warn!(sequence = envelope.sequence, error = %e, "Validator fold diverged; rebuilding from the chain");
            match replay_validator(&state.wal) {
                Ok(validator) => state.validator = validator,
                Err(reason) => {
                    let fault = IntegrityFault::ValidatorDivergence {
                        segment_id,
                        offset,
                        sequence: envelope.sequence,
                        reason,
                    };
                    error!(fault = %fault, "Validator cannot be rebuilt; locking ledger");
                    state.fault = Some(fault.clone());
                    return Err(AppendError::IntegrityLocked(fault));
                }
            }
        }
        state.tail = ChainTail::after(&envelope);
        state.by_event_id.insert(envelope.event_id, envelope.sequence);

        // Notify under the lock so notices leave in sequence order.
        self.notifier
            .notify(SequenceNotice {
                sequence: envelope.sequence,
            })
            .await;
        debug!(
            sequence = envelope.sequence,
            event_type = %envelope.event_type,
            actor = %envelope.actor_id,
            "Event appended"
        );
        Ok(envelope)
    }
}

/// Fold every committed entry into a fresh validator.
fn replay_validator(wal: &WriteAheadLog) -> Result<Validator, String> {
    let mut validator = Validator::new();
    let entries = wal
        .read_entries(0, wal.len() as usize)
        .map_err(|e| e.to_string())?;
    for (_, bytes) in entries {
        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        validator.absorb(&envelope).map_err(|e| e.to_string())?;
    }
    Ok(validator)
}

/// Replay the WAL into a fresh writer state. Entries that do not decode or
/// do not chain end the readable prefix and set a fault.
fn load(config: &LedgerConfig, storage: &Arc<dyn WalStorage>) -> Result<WriterState, LedgerError> {
    let (mut wal, recovery) = WriteAheadLog::open(config.wal_config(), storage.clone())?;
    let mut fault = recovery.fault;
    let mut verifier = ChainVerifier::new();
    let mut validator = Validator::new();
    let mut by_event_id = HashMap::with_capacity(recovery.entries.len());

    for (index, raw) in recovery.entries.iter().enumerate() {
        let checked = serde_json::from_slice::<Envelope>(&raw.bytes)
            .map_err(|e| e.to_string())
            .and_then(|envelope| {
                verifier
                    .push(&envelope)
                    .map(|_| envelope)
                    .map_err(|e| e.to_string())
            });
        match checked {
            Ok(envelope) => {
                if let Err(e) = validator.absorb(&envelope) {
                    warn!(sequence = envelope.sequence, error = %e, "Validator fold failed during replay");
                }
                by_event_id.insert(envelope.event_id, envelope.sequence);
            }
            Err(reason) => {
                let chain_fault = IntegrityFault::ChainBreak {
                    segment_id: raw.segment_id,
                    offset: raw.offset,
                    sequence: raw.sequence,
                    reason,
                };
                error!(fault = %chain_fault, "Hash chain verification failed during replay");
                wal.truncate_readable(index as u64);
                fault = Some(chain_fault);
                break;
            }
        }
    }

    Ok(WriterState {
        wal,
        validator,
        tail: *verifier.tail(),
        by_event_id,
        fault,
    })
}
