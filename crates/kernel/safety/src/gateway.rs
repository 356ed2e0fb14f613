use std::sync::Arc;

use conclave_kernel_chain::{Digest, EnvelopeDraft, HashAlgorithm};
use conclave_kernel_ledger::LedgerStore;
use conclave_types::{ActorId, EventKind, FilterVerb};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SafetyError;
use crate::filter::{screen, CoercionFilter, FilterOutcome};

/// Payload of `filter.content.*`. Holds a digest of the screened content,
/// never the content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub content_digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    /// Set when accepted content differs from the original.
    #[serde(default)]
    pub transformed: bool,
}

/// Screens outbound content and records every outcome in the ledger before
/// handing it back.
#[derive(Clone)]
pub struct FilterGateway {
    ledger: LedgerStore,
    filter: Arc<dyn CoercionFilter>,
}

impl FilterGateway {
    pub fn new(ledger: LedgerStore, filter: Arc<dyn CoercionFilter>) -> Self {
        Self { ledger, filter }
    }

    pub async fn screen_and_record(
        &self,
        actor: ActorId,
        content: &str,
    ) -> Result<FilterOutcome, SafetyError> {
        self.ledger.halt_flag().check()?;

        let outcome = screen(self.filter.as_ref(), content);
        let content_digest = HashAlgorithm::Blake3.digest(content.as_bytes());
        let (verb, record) = match &outcome {
            FilterOutcome::Accepted(filtered) => (
                FilterVerb::Accepted,
                FilterRecord {
                    content_digest,
                    reason: None,
                    violation: None,
                    transformed: filtered.as_str() != content,
                },
            ),
            FilterOutcome::Rejected { reason } => (
                FilterVerb::Rejected,
                FilterRecord {
                    content_digest,
                    reason: Some(reason.clone()),
                    violation: None,
                    transformed: false,
                },
            ),
            FilterOutcome::Blocked { violation } => (
                FilterVerb::Blocked,
                FilterRecord {
                    content_digest,
                    reason: None,
                    violation: Some(violation.clone()),
                    transformed: false,
                },
            ),
        };

        let draft = EnvelopeDraft::new(EventKind::Filter(verb), actor, serde_json::to_value(&record)?);
        let envelope = self.ledger.append(draft).await?;
        debug!(sequence = envelope.sequence, outcome = %verb, "Filter outcome recorded");
        Ok(outcome)
    }
}
