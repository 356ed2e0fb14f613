use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use conclave_kernel_chain::{Digest, Envelope};
use conclave_types::{ActorId, EntityId, EventKind, LegitimacyVerb};
use serde::{Deserialize, Serialize};

use crate::band::{next_band, Acknowledgment, BandError, BandTrigger, LegitimacyBand};
use crate::fold::{admit, Admission, Anomaly, AnomalyKind, Applied, Cursor, Fold, FoldError};
use crate::payload::LegitimacyPayload;

/// Violation timestamps kept per entity for density policies.
pub const RECENT_VIOLATION_CAP: usize = 256;

/// Derived view of one entity's legitimacy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandRecord {
    pub entity_id: EntityId,
    pub current_band: LegitimacyBand,
    pub band_entered_at: DateTime<Utc>,
    pub violation_count: u64,
    pub recent_violations: VecDeque<DateTime<Utc>>,
    pub last_applied_sequence: u64,
    pub last_applied_hash: Digest,
}

impl BandRecord {
    pub fn registered(entity_id: EntityId, band: LegitimacyBand, at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            current_band: band,
            band_entered_at: at,
            violation_count: 0,
            recent_violations: VecDeque::new(),
            last_applied_sequence: 0,
            last_applied_hash: Digest::GENESIS_SENTINEL,
        }
    }

    fn touch(&mut self, envelope: &Envelope) {
        self.last_applied_sequence = envelope.sequence;
        self.last_applied_hash = envelope.hash;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegitimacySnapshot {
    pub cursor: Option<Cursor>,
    pub records: BTreeMap<EntityId, BandRecord>,
    pub anomalies: Vec<Anomaly>,
}

/// The legitimacy-band projection as a pure fold.
#[derive(Clone, Debug, Default)]
pub struct LegitimacyBoard {
    records: BTreeMap<EntityId, BandRecord>,
    anomalies: Vec<Anomaly>,
    cursor: Option<Cursor>,
}

impl LegitimacyBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LegitimacySnapshot) -> Self {
        Self {
            records: snapshot.records,
            anomalies: snapshot.anomalies,
            cursor: snapshot.cursor,
        }
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&BandRecord> {
        self.records.get(entity_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &BandRecord> {
        self.records.values()
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Write-time check of a legitimacy event. Returns the band the entity
    /// would be in afterwards.
    pub fn check_band(
        &self,
        verb: LegitimacyVerb,
        payload: &LegitimacyPayload,
        actor: &ActorId,
    ) -> Result<LegitimacyBand, BandError> {
        let existing = self.records.get(&payload.entity_id);
        match (verb, existing) {
            (LegitimacyVerb::Registered, Some(_)) => {
                Err(BandError::DuplicateEntity(payload.entity_id.clone()))
            }
            (LegitimacyVerb::Registered, None) => {
                Ok(payload.band.unwrap_or(LegitimacyBand::Stable))
            }
            (_, None) => Err(BandError::UnknownEntity(payload.entity_id.clone())),
            (LegitimacyVerb::ViolationRecorded, Some(record)) => Ok(record.current_band),
            (LegitimacyVerb::Decayed, Some(record)) => {
                let to = payload.band.ok_or(BandError::MissingTarget)?;
                next_band(record.current_band, &BandTrigger::Decay { to })
            }
            (LegitimacyVerb::Acknowledged, Some(record)) => {
                let to = payload.band.ok_or(BandError::MissingTarget)?;
                let ack = Acknowledgment::attest(actor.clone(), to)?;
                next_band(record.current_band, &BandTrigger::Acknowledged(ack))
            }
        }
    }

    fn apply_legitimacy(&mut self, envelope: &Envelope, verb: LegitimacyVerb) -> Applied {
        let payload: LegitimacyPayload = match envelope.payload_as() {
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
        let band = match self.check_band(verb, &payload, &envelope.actor_id) {
            Ok(band) => band,
            Err(error) => return self.anomaly(envelope, AnomalyKind::Band { error }),
        };

        let record = self
            .records
            .entry(payload.entity_id.clone())
            .or_insert_with(|| {
                BandRecord::registered(payload.entity_id.clone(), band, envelope.timestamp)
            });
        if verb == LegitimacyVerb::ViolationRecorded {
            record.violation_count += 1;
            record.recent_violations.push_back(envelope.timestamp);
            while record.recent_violations.len() > RECENT_VIOLATION_CAP {
                record.recent_violations.pop_front();
            }
        } else if record.current_band != band {
            record.current_band = band;
            record.band_entered_at = envelope.timestamp;
        }
        record.touch(envelope);
        Applied::Changed
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
}

impl Fold for LegitimacyBoard {
    type Snapshot = LegitimacySnapshot;

    fn apply(&mut self, envelope: &Envelope) -> Result<Applied, FoldError> {
        if let Admission::Replay = admit(self.cursor.as_ref(), envelope)? {
            return Ok(Applied::AlreadyApplied);
        }
        let applied = match envelope.kind() {
            Ok(EventKind::Legitimacy(verb)) => self.apply_legitimacy(envelope, verb),
            _ => Applied::Ignored,
        };
        self.cursor = Some(Cursor::of(envelope));
        Ok(applied)
    }

    fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    fn snapshot(&self) -> LegitimacySnapshot {
        LegitimacySnapshot {
            cursor: self.cursor,
            records: self.records.clone(),
            anomalies: self.anomalies.clone(),
        }
    }
}
