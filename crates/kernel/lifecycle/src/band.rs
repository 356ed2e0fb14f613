use chrono::{DateTime, Duration, Utc};
use conclave_types::{ActorId, EntityId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::legitimacy::BandRecord;

/// Legitimacy bands, best first. The derived ordering is the band order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegitimacyBand {
    Stable,
    Strained,
    Eroding,
    Compromised,
    Failed,
}

impl LegitimacyBand {
    pub const ALL: [LegitimacyBand; 5] = [
        LegitimacyBand::Stable,
        LegitimacyBand::Strained,
        LegitimacyBand::Eroding,
        LegitimacyBand::Compromised,
        LegitimacyBand::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LegitimacyBand::Stable => "stable",
            LegitimacyBand::Strained => "strained",
            LegitimacyBand::Eroding => "eroding",
            LegitimacyBand::Compromised => "compromised",
            LegitimacyBand::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LegitimacyBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that a human explicitly acknowledged an entity's recovery.
///
/// The fields are private and [`Acknowledgment::attest`] is the only
/// constructor, so automation can never manufacture one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgment {
    actor: ActorId,
    to: LegitimacyBand,
}

impl Acknowledgment {
    pub fn attest(actor: ActorId, to: LegitimacyBand) -> Result<Self, BandError> {
        if actor.is_automation() {
            return Err(BandError::AutomationCannotAcknowledge { actor });
        }
        Ok(Self { actor, to })
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn to(&self) -> LegitimacyBand {
        self.to
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BandTrigger {
    /// System-derived, from violation density.
    Decay { to: LegitimacyBand },
    Acknowledged(Acknowledgment),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BandError {
    #[error("decay must move toward failed: {from} -> {to}")]
    UpwardWithoutAcknowledgment {
        from: LegitimacyBand,
        to: LegitimacyBand,
    },

    #[error("acknowledgment must move toward stable: {from} -> {to}")]
    AcknowledgmentMustImprove {
        from: LegitimacyBand,
        to: LegitimacyBand,
    },

    #[error("{actor} is an automation actor and cannot acknowledge")]
    AutomationCannotAcknowledge { actor: ActorId },

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity {0} already registered")]
    DuplicateEntity(EntityId),

    #[error("band transition requires a target band")]
    MissingTarget,
}

/// The band state machine.
pub fn next_band(
    current: LegitimacyBand,
    trigger: &BandTrigger,
) -> Result<LegitimacyBand, BandError> {
    match trigger {
        BandTrigger::Decay { to } if *to > current => Ok(*to),
        BandTrigger::Decay { to } => Err(BandError::UpwardWithoutAcknowledgment {
            from: current,
            to: *to,
        }),
        BandTrigger::Acknowledged(ack) if ack.to < current => Ok(ack.to),
        BandTrigger::Acknowledged(ack) => Err(BandError::AcknowledgmentMustImprove {
            from: current,
            to: ack.to,
        }),
    }
}

/// Policy deciding which band an entity's violation history warrants.
///
/// The substrate only ever acts on a verdict worse than the current band.
pub trait ViolationDensity: Send + Sync {
    fn assess(&self, record: &BandRecord, now: DateTime<Utc>) -> LegitimacyBand;
}

/// Count violations inside a rolling window and map the count to a band.
#[derive(Clone, Debug)]
pub struct WindowedThresholds {
    pub window: Duration,
    /// `(minimum violations in window, band)`, checked from the most severe.
    pub thresholds: Vec<(u32, LegitimacyBand)>,
}

impl Default for WindowedThresholds {
    fn default() -> Self {
        Self {
            window: Duration::days(30),
            thresholds: vec![
                (3, LegitimacyBand::Strained),
                (6, LegitimacyBand::Eroding),
                (10, LegitimacyBand::Compromised),
                (15, LegitimacyBand::Failed),
            ],
        }
    }
}

impl ViolationDensity for WindowedThresholds {
    fn assess(&self, record: &BandRecord, now: DateTime<Utc>) -> LegitimacyBand {
        let since = now - self.window;
        let in_window = record
            .recent_violations
            .iter()
            .filter(|at| **at > since)
            .count() as u32;
        self.thresholds
            .iter()
            .filter(|(min, _)| in_window >= *min)
            .map(|(_, band)| *band)
            .max()
            .unwrap_or(LegitimacyBand::Stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_only_moves_down() {
        assert_eq!(
            next_band(
                LegitimacyBand::Stable,
                &BandTrigger::Decay {
                    to: LegitimacyBand::Eroding
                }
            ),
            Ok(LegitimacyBand::Eroding)
        );
        for to in [LegitimacyBand::Stable, LegitimacyBand::Strained] {
            assert!(matches!(
                next_band(LegitimacyBand::Strained, &BandTrigger::Decay { to }),
                Err(BandError::UpwardWithoutAcknowledgment { .. })
            ));
        }
    }

    #[test]
    fn only_humans_acknowledge() {
        for actor in ActorId::automation() {
            assert!(matches!(
                Acknowledgment::attest(actor, LegitimacyBand::Stable),
                Err(BandError::AutomationCannotAcknowledge { .. })
            ));
        }
        let ack = Acknowledgment::attest(ActorId::new("steward"), LegitimacyBand::Strained).unwrap();
        assert_eq!(
            next_band(LegitimacyBand::Failed, &BandTrigger::Acknowledged(ack.clone())),
            Ok(LegitimacyBand::Strained)
        );
        assert!(matches!(
            next_band(LegitimacyBand::Stable, &BandTrigger::Acknowledged(ack)),
            Err(BandError::AcknowledgmentMustImprove { .. })
        ));
    }

    #[test]
    fn windowed_thresholds_ignore_old_violations() {
        let now = Utc::now();
        let mut record = BandRecord::registered(EntityId::new("e"), LegitimacyBand::Stable, now);
        for days in [1, 2, 3, 4, 60, 61, 62] {
            record.recent_violations.push_back(now - Duration::days(days));
        }
        let policy = WindowedThresholds::default();
        assert_eq!(policy.assess(&record, now), LegitimacyBand::Strained);
        record.recent_violations.push_back(now);
        record.recent_violations.push_back(now);
        assert_eq!(policy.assess(&record, now), LegitimacyBand::Eroding);
    }
}
