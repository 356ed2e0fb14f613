use serde::{Deserialize, Serialize};

/// Unique identifier of a ledger event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// Identity of whoever authored an event.
///
/// A handful of identities are reserved for automation. Events authored by
/// them are system-derived and can never stand in for an explicit human
/// acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub const SYSTEM: &'static str = "system";
    pub const WITNESS: &'static str = "witness";
    pub const HALT_CIRCUIT: &'static str = "halt-circuit";
    pub const MERKLE_ACCUMULATOR: &'static str = "merkle-accumulator";
    pub const LEDGER_CUSTODIAN: &'static str = "ledger-custodian";

    const AUTOMATION: [&'static str; 5] = [
        Self::SYSTEM,
        Self::WITNESS,
        Self::HALT_CIRCUIT,
        Self::MERKLE_ACCUMULATOR,
        Self::LEDGER_CUSTODIAN,
    ];

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Timeout and policy automation.
    pub fn system() -> Self {
        Self::new(Self::SYSTEM)
    }

    pub fn witness() -> Self {
        Self::new(Self::WITNESS)
    }

    pub fn halt_circuit() -> Self {
        Self::new(Self::HALT_CIRCUIT)
    }

    pub fn merkle_accumulator() -> Self {
        Self::new(Self::MERKLE_ACCUMULATOR)
    }

    pub fn ledger_custodian() -> Self {
        Self::new(Self::LEDGER_CUSTODIAN)
    }

    /// Every reserved automation identity.
    pub fn automation() -> Vec<Self> {
        Self::AUTOMATION.iter().map(|id| Self::new(*id)).collect()
    }

    pub fn is_automation(&self) -> bool {
        Self::AUTOMATION.contains(&self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Task identifier, chosen by the branch that authorizes the task.
    TaskId
);
string_id!(
    /// Cluster a task is routed to.
    ClusterId
);
string_id!(
    /// Entity whose legitimacy band is tracked.
    EntityId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automation_actors_are_recognised() {
        for actor in ActorId::automation() {
            assert!(actor.is_automation(), "{actor} should be automation");
        }
        assert!(!ActorId::new("earl-7").is_automation());
    }

    #[test]
    fn event_id_parses_its_display_form() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let json = serde_json::to_string(&TaskId::new("T1")).unwrap();
        assert_eq!(json, "\"T1\"");
    }
}
