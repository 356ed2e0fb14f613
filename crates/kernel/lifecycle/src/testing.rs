use chrono::{DateTime, Duration, TimeZone, Utc};
use conclave_kernel_chain::{link, Candidate, ChainTail, Envelope, EnvelopeDraft, HashAlgorithm};
use conclave_types::{ActorId, EventId, EventKind};
use serde_json::Value;

/// Builds a linked chain in memory, one second per envelope.
pub(crate) struct ChainBuilder {
    tail: ChainTail,
    start: DateTime<Utc>,
    envelopes: Vec<Envelope>,
}

impl ChainBuilder {
    pub(crate) fn new() -> Self {
        Self {
            tail: ChainTail::genesis(),
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            envelopes: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, kind: EventKind, actor: &str, payload: Value) -> &Envelope {
        self.push_raw(&kind.as_event_type(), actor, payload)
    }

    pub(crate) fn push_raw(&mut self, event_type: &str, actor: &str, payload: Value) -> &Envelope {
        let draft = EnvelopeDraft {
            event_type: event_type.to_string(),
            actor_id: ActorId::new(actor),
            schema_version: 1,
            payload,
        };
        let timestamp = self.start + Duration::seconds(self.envelopes.len() as i64);
        let envelope = link(
            &self.tail,
            Candidate {
                draft,
                event_id: EventId::new(),
                timestamp,
            },
            HashAlgorithm::Blake3,
        )
        .unwrap();
        self.tail = ChainTail::after(&envelope);
        self.envelopes.push(envelope);
        self.envelopes.last().unwrap()
    }

    pub(crate) fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }
}
