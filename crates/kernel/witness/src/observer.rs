use std::collections::HashSet;

use conclave_kernel_chain::{verify_link, ChainTail, Envelope};
use conclave_types::{EventKind, HaltVerb, WitnessVerb};
use tracing::warn;

use crate::finding::{
    Finding, FindingKey, GapFinding, GapSource, ViolationFinding, ViolationKind,
};

/// What the witness has seen so far. Pure: fed envelopes and notices, it
/// produces findings and never touches the ledger.
#[derive(Debug)]
pub struct WitnessState {
    expected_next_sequence: u64,
    expected_notice: Option<u64>,
    tail: ChainTail,
    halt_active: bool,
    recorded: HashSet<FindingKey>,
}

impl Default for WitnessState {
    fn default() -> Self {
        Self::new()
    }
}

impl WitnessState {
    pub fn new() -> Self {
        Self {
            expected_next_sequence: 0,
            expected_notice: None,
            tail: ChainTail::genesis(),
            halt_active: false,
            recorded: HashSet::new(),
        }
    }

    pub fn expected_next_sequence(&self) -> u64 {
        self.expected_next_sequence
    }

    pub fn expected_notice(&self) -> Option<u64> {
        self.expected_notice
    }

    /// Notices are expected from `next` onward.
    pub fn expect_notices_from(&mut self, next: u64) {
        self.expected_notice = Some(next);
    }

    pub fn is_recorded(&self, key: &FindingKey) -> bool {
        self.recorded.contains(key)
    }

    pub fn mark_recorded(&mut self, key: FindingKey) {
        self.recorded.insert(key);
    }

    /// A notice for `sequence` arrived. Notices are best effort, so one
    /// beyond the expected next means the ones in between were lost.
    pub fn observe_notice(&mut self, sequence: u64) -> Option<Finding> {
        let Some(expected) = self.expected_notice else {
            self.expected_notice = Some(sequence + 1);
            return None;
        };
        if sequence < expected {
            return None;
        }
        self.expected_notice = Some(sequence + 1);
        (sequence > expected).then(|| {
            Finding::Gap(GapFinding {
                source: GapSource::Notification,
                expected_sequence: expected,
                observed_sequence: sequence,
            })
        })
    }

    /// Fold one envelope read from the ledger.
    pub fn observe(&mut self, envelope: &Envelope) -> Vec<Finding> {
        let mut findings = Vec::new();
        if envelope.sequence < self.expected_next_sequence {
            return findings;
        }
        if envelope.sequence > self.expected_next_sequence {
            findings.push(Finding::Gap(GapFinding {
                source: GapSource::LedgerRead,
                expected_sequence: self.expected_next_sequence,
                observed_sequence: envelope.sequence,
            }));
        } else if let Err(reason) = verify_link(&self.tail, envelope) {
            findings.push(Finding::Violation(ViolationFinding {
                kind: ViolationKind::ChainLink,
                sequence: envelope.sequence,
                event_type: envelope.event_type.clone(),
                detail: reason.to_string(),
            }));
        }

        match envelope.kind() {
            Ok(EventKind::Halt(HaltVerb::Triggered)) => self.halt_active = true,
            Ok(EventKind::Halt(HaltVerb::Released)) => self.halt_active = false,
            Ok(EventKind::Witness(verb)) => self.absorb_record(verb, envelope),
            Ok(kind) if self.halt_active && !kind.is_halt_exempt() => {
                findings.push(Finding::Violation(ViolationFinding {
                    kind: ViolationKind::WorkAfterHalt,
                    sequence: envelope.sequence,
                    event_type: envelope.event_type.clone(),
                    detail: "recorded while a halt was in force".into(),
                }));
            }
            _ => {}
        }

        self.expected_next_sequence = envelope.sequence + 1;
        self.tail = ChainTail::after(envelope);
        findings
    }

    fn absorb_record(&mut self, verb: WitnessVerb, envelope: &Envelope) {
        let key = match verb {
            WitnessVerb::GapDetected => envelope
                .payload_as::<GapFinding>()
                .map(|gap| FindingKey::Gap(gap.source, gap.observed_sequence)),
            WitnessVerb::ViolationDetected => envelope
                .payload_as::<ViolationFinding>()
                .map(|v| FindingKey::Violation(v.kind, v.sequence)),
        };
        match key {
            Ok(key) => {
                self.recorded.insert(key);
            }
            Err(e) => warn!(sequence = envelope.sequence, error = %e, "Unreadable witness record"),
        }
    }
}
