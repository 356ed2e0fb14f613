//! Typed payloads of the event kinds the folds interpret.
//!
//! Unknown payload fields are tolerated; missing required ones are not.

use conclave_types::{ActorId, ClusterId, EntityId, TaskId};
use serde::{Deserialize, Serialize};

use crate::band::LegitimacyBand;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Payload of every `<branch>.task.<verb>` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    /// Initiator. Defaults to the authoring actor on `authorized`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earl_id: Option<ActorId>,
    /// Required on `routed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set on transitions the substrate made on its own.
    #[serde(default, skip_serializing_if = "is_false")]
    pub automatic: bool,
}

impl TaskPayload {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            earl_id: None,
            cluster_id: None,
            reason: None,
            automatic: false,
        }
    }

    pub fn with_cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn automatic(mut self) -> Self {
        self.automatic = true;
        self
    }
}

/// Payload of `governance.legitimacy.*`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegitimacyPayload {
    pub entity_id: EntityId,
    /// Starting band on `registered`, target band on `decayed`/`acknowledged`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<LegitimacyBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LegitimacyPayload {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            band: None,
            detail: None,
        }
    }

    pub fn with_band(mut self, band: LegitimacyBand) -> Self {
        self.band = Some(band);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Payload of `halt.circuit.triggered` and `halt.circuit.released`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltPayload {
    pub epoch: u64,
    /// Who pulled or released the circuit; the envelope author is always the
    /// circuit itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<ActorId>,
}
