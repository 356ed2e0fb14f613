use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subsystem that produced an event: always the first dot-segment of the
/// event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Legislative,
    Executive,
    Administrative,
    Judicial,
    Advisory,
    Governance,
    Halt,
    Witness,
    Merkle,
    Ledger,
    Filter,
}

impl Branch {
    pub const ALL: [Branch; 11] = [
        Branch::Legislative,
        Branch::Executive,
        Branch::Administrative,
        Branch::Judicial,
        Branch::Advisory,
        Branch::Governance,
        Branch::Halt,
        Branch::Witness,
        Branch::Merkle,
        Branch::Ledger,
        Branch::Filter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Branch::Legislative => "legislative",
            Branch::Executive => "executive",
            Branch::Administrative => "administrative",
            Branch::Judicial => "judicial",
            Branch::Advisory => "advisory",
            Branch::Governance => "governance",
            Branch::Halt => "halt",
            Branch::Witness => "witness",
            Branch::Merkle => "merkle",
            Branch::Ledger => "ledger",
            Branch::Filter => "filter",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == segment)
    }

    /// Derive the branch of a dotted event type.
    pub fn of(event_type: &str) -> Option<Self> {
        event_type.split('.').next().and_then(Self::from_segment)
    }

    /// Service branches are the ones allowed to drive task lifecycles.
    pub fn is_service(self) -> bool {
        matches!(
            self,
            Branch::Legislative
                | Branch::Executive
                | Branch::Administrative
                | Branch::Judicial
                | Branch::Advisory
        )
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! verb_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn from_segment(segment: &str) -> Option<Self> {
                match segment {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

verb_enum!(
    /// Task lifecycle verbs. Each verb names the state it moves a task into;
    /// `started` enters `in_progress`.
    TaskVerb {
        Authorized => "authorized",
        Activated => "activated",
        Routed => "routed",
        Accepted => "accepted",
        Started => "started",
        Reported => "reported",
        Aggregated => "aggregated",
        Completed => "completed",
        Declined => "declined",
        Quarantined => "quarantined",
        Nullified => "nullified",
    }
);

verb_enum!(
    /// `governance.legitimacy.*`
    LegitimacyVerb {
        Registered => "registered",
        ViolationRecorded => "violation_recorded",
        Decayed => "decayed",
        Acknowledged => "acknowledged",
    }
);

verb_enum!(
    /// `halt.circuit.*`
    HaltVerb {
        Triggered => "triggered",
        Released => "released",
    }
);

verb_enum!(
    /// `witness.*`
    WitnessVerb {
        GapDetected => "gap_detected",
        ViolationDetected => "violation_detected",
    }
);

verb_enum!(
    /// `filter.content.*`
    FilterVerb {
        Accepted => "accepted",
        Rejected => "rejected",
        Blocked => "blocked",
    }
);

verb_enum!(
    /// `ledger.*`
    LedgerVerb {
        Genesis => "genesis",
        IntegrityViolated => "violated",
    }
);

/// Closed set of every event type the ledger accepts.
///
/// Adding an event type means adding a variant here, which every exhaustive
/// `match` over `EventKind` then has to account for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `<service branch>.task.<verb>`
    Task { branch: Branch, verb: TaskVerb },
    /// `governance.legitimacy.<verb>`
    Legitimacy(LegitimacyVerb),
    /// `halt.circuit.<verb>`
    Halt(HaltVerb),
    /// `witness.sequence.gap_detected` / `witness.chain.violation_detected`
    Witness(WitnessVerb),
    /// `merkle.epoch.sealed`
    MerkleEpochSealed,
    /// `ledger.chain.genesis` / `ledger.integrity.violated`
    Ledger(LedgerVerb),
    /// `filter.content.<verb>`
    Filter(FilterVerb),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl EventKind {
    /// Parse a dotted `branch.noun.verb` event type.
    pub fn parse(event_type: &str) -> Result<Self, UnknownEventType> {
        let unknown = || UnknownEventType(event_type.to_string());
        let mut parts = event_type.split('.');
        let (Some(branch), Some(noun), Some(verb), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(unknown());
        };
        let branch = Branch::from_segment(branch).ok_or_else(unknown)?;

        let kind = match (branch, noun) {
            (b, "task") if b.is_service() => EventKind::Task {
                branch: b,
                verb: TaskVerb::from_segment(verb).ok_or_else(unknown)?,
            },
            (Branch::Governance, "legitimacy") => {
                EventKind::Legitimacy(LegitimacyVerb::from_segment(verb).ok_or_else(unknown)?)
            }
            (Branch::Halt, "circuit") => {
                EventKind::Halt(HaltVerb::from_segment(verb).ok_or_else(unknown)?)
            }
            (Branch::Witness, "sequence") if verb == "gap_detected" => {
                EventKind::Witness(WitnessVerb::GapDetected)
            }
            (Branch::Witness, "chain") if verb == "violation_detected" => {
                EventKind::Witness(WitnessVerb::ViolationDetected)
            }
            (Branch::Merkle, "epoch") if verb == "sealed" => EventKind::MerkleEpochSealed,
            (Branch::Ledger, "chain") if verb == "genesis" => EventKind::Ledger(LedgerVerb::Genesis),
            (Branch::Ledger, "integrity") if verb == "violated" => {
                EventKind::Ledger(LedgerVerb::IntegrityViolated)
            }
            (Branch::Filter, "content") => {
                EventKind::Filter(FilterVerb::from_segment(verb).ok_or_else(unknown)?)
            }
            _ => return Err(unknown()),
        };
        Ok(kind)
    }

    /// The branch is a function of the kind, never an input.
    pub fn branch(&self) -> Branch {
        match self {
            EventKind::Task { branch, .. } => *branch,
            EventKind::Legitimacy(_) => Branch::Governance,
            EventKind::Halt(_) => Branch::Halt,
            EventKind::Witness(_) => Branch::Witness,
            EventKind::MerkleEpochSealed => Branch::Merkle,
            EventKind::Ledger(_) => Branch::Ledger,
            EventKind::Filter(_) => Branch::Filter,
        }
    }

    /// Render the dotted event type.
    pub fn as_event_type(&self) -> String {
        match self {
            EventKind::Task { branch, verb } => format!("{branch}.task.{verb}"),
            EventKind::Legitimacy(verb) => format!("governance.legitimacy.{verb}"),
            EventKind::Halt(verb) => format!("halt.circuit.{verb}"),
            EventKind::Witness(WitnessVerb::GapDetected) => "witness.sequence.gap_detected".into(),
            EventKind::Witness(WitnessVerb::ViolationDetected) => {
                "witness.chain.violation_detected".into()
            }
            EventKind::MerkleEpochSealed => "merkle.epoch.sealed".into(),
            EventKind::Ledger(LedgerVerb::Genesis) => "ledger.chain.genesis".into(),
            EventKind::Ledger(LedgerVerb::IntegrityViolated) => "ledger.integrity.violated".into(),
            EventKind::Filter(verb) => format!("filter.content.{verb}"),
        }
    }

    /// Record-keeping kinds that must still be writable while halted.
    pub fn is_halt_exempt(&self) -> bool {
        matches!(
            self,
            EventKind::Halt(_)
                | EventKind::Witness(_)
                | EventKind::MerkleEpochSealed
                | EventKind::Ledger(_)
        )
    }

    pub fn task_verb(&self) -> Option<TaskVerb> {
        match self {
            EventKind::Task { verb, .. } => Some(*verb),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_event_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_kind() -> Vec<EventKind> {
        let mut kinds = Vec::new();
        for branch in Branch::ALL.into_iter().filter(|b| b.is_service()) {
            for verb in TaskVerb::ALL {
                kinds.push(EventKind::Task { branch, verb: *verb });
            }
        }
        kinds.extend(LegitimacyVerb::ALL.iter().map(|v| EventKind::Legitimacy(*v)));
        kinds.extend(HaltVerb::ALL.iter().map(|v| EventKind::Halt(*v)));
        kinds.extend(WitnessVerb::ALL.iter().map(|v| EventKind::Witness(*v)));
        kinds.push(EventKind::MerkleEpochSealed);
        kinds.extend(LedgerVerb::ALL.iter().map(|v| EventKind::Ledger(*v)));
        kinds.extend(FilterVerb::ALL.iter().map(|v| EventKind::Filter(*v)));
        kinds
    }

    #[test]
    fn every_kind_parses_from_its_event_type() {
        for kind in every_kind() {
            let text = kind.as_event_type();
            assert_eq!(EventKind::parse(&text).unwrap(), kind, "{text}");
            assert_eq!(Branch::of(&text), Some(kind.branch()));
        }
    }

    #[test]
    fn unknown_event_types_are_rejected() {
        for bad in [
            "",
            "executive",
            "executive.task",
            "executive.task.exploded",
            "governance.task.authorized",
            "witness.task.authorized",
            "halt.circuit.triggered.extra",
            "treasury.task.authorized",
            "merkle.epoch.opened",
        ] {
            assert!(EventKind::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn halt_exempt_kinds_are_record_keeping_only() {
        assert!(EventKind::Halt(HaltVerb::Triggered).is_halt_exempt());
        assert!(EventKind::Witness(WitnessVerb::GapDetected).is_halt_exempt());
        assert!(!EventKind::Task {
            branch: Branch::Executive,
            verb: TaskVerb::Accepted
        }
        .is_halt_exempt());
        assert!(!EventKind::Filter(FilterVerb::Accepted).is_halt_exempt());
    }
}
