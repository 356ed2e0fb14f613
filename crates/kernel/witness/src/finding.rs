use conclave_kernel_chain::EnvelopeDraft;
use conclave_types::{ActorId, EventKind, WitnessVerb};
use serde::{Deserialize, Serialize};

/// Where a gap was seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSource {
    Notification,
    LedgerRead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// An envelope that does not link to its predecessor.
    ChainLink,
    /// Non-exempt work recorded while the ledger shows a halt in force.
    WorkAfterHalt,
}

/// Payload of `witness.sequence.gap_detected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapFinding {
    pub source: GapSource,
    pub expected_sequence: u64,
    pub observed_sequence: u64,
}

/// Payload of `witness.chain.violation_detected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationFinding {
    pub kind: ViolationKind,
    pub sequence: u64,
    pub event_type: String,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Finding {
    Gap(GapFinding),
    Violation(ViolationFinding),
}

/// Identity of a finding, so the same observation is recorded once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FindingKey {
    Gap(GapSource, u64),
    Violation(ViolationKind, u64),
}

impl Finding {
    pub fn key(&self) -> FindingKey {
        match self {
            Finding::Gap(gap) => FindingKey::Gap(gap.source, gap.observed_sequence),
            Finding::Violation(v) => FindingKey::Violation(v.kind, v.sequence),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Finding::Gap(_) => EventKind::Witness(WitnessVerb::GapDetected),
            Finding::Violation(_) => EventKind::Witness(WitnessVerb::ViolationDetected),
        }
    }

    pub fn to_draft(&self) -> Result<EnvelopeDraft, serde_json::Error> {
        let payload = match self {
            Finding::Gap(gap) => serde_json::to_value(gap)?,
            Finding::Violation(v) => serde_json::to_value(v)?,
        };
        Ok(EnvelopeDraft::new(self.kind(), ActorId::witness(), payload))
    }
}
