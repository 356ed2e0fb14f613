use std::collections::BTreeSet;

use conclave_types::{ActorId, EventKind, LegitimacyVerb};

use crate::error::AppendError;

/// Who may author ledger events, and which kinds.
///
/// Reserved automation identities are always known. Record-keeping kinds
/// belong to exactly one automation identity each; nobody else may write
/// them.
#[derive(Clone, Debug, Default)]
pub struct ActorRegistry {
    known: BTreeSet<ActorId>,
    open: bool,
}

impl ActorRegistry {
    pub fn new(actors: impl IntoIterator<Item = ActorId>) -> Self {
        Self {
            known: actors.into_iter().collect(),
            open: false,
        }
    }

    /// Accept any non-reserved actor id. Permission rules still apply.
    pub fn permissive() -> Self {
        Self {
            known: BTreeSet::new(),
            open: true,
        }
    }

    pub fn register(&mut self, actor: ActorId) -> bool {
        self.known.insert(actor)
    }

    pub fn is_known(&self, actor: &ActorId) -> bool {
        actor.is_automation() || self.open || self.known.contains(actor)
    }

    pub fn authorize(&self, actor: &ActorId, kind: &EventKind) -> Result<(), AppendError> {
        if !self.is_known(actor) {
            return Err(AppendError::UnknownActor(actor.clone()));
        }
        let allowed = match kind {
            EventKind::Ledger(_) => actor.as_str() == ActorId::LEDGER_CUSTODIAN,
            EventKind::Halt(_) => actor.as_str() == ActorId::HALT_CIRCUIT,
            EventKind::Witness(_) => actor.as_str() == ActorId::WITNESS,
            EventKind::MerkleEpochSealed => actor.as_str() == ActorId::MERKLE_ACCUMULATOR,
            EventKind::Legitimacy(LegitimacyVerb::Decayed) => actor.as_str() == ActorId::SYSTEM,
            EventKind::Legitimacy(LegitimacyVerb::Acknowledged) => !actor.is_automation(),
            EventKind::Legitimacy(_) | EventKind::Task { .. } | EventKind::Filter(_) => {
                !actor.is_automation() || actor.as_str() == ActorId::SYSTEM
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(AppendError::ActorNotPermitted {
                actor: actor.clone(),
                event_type: kind.as_event_type(),
            })
        }
    }
}
