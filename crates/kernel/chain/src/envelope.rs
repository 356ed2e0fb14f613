use chrono::{DateTime, Utc};
use conclave_types::{ActorId, Branch, EventId, EventKind, UnknownEventType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_bytes;
use crate::digest::{Digest, HashAlgorithm};
use crate::error::ChainError;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// What a writer submits. Sequence, timestamp, identifiers and hashes are
/// assigned by the ledger; a draft carrying any of them is rejected at
/// deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeDraft {
    pub event_type: String,
    pub actor_id: ActorId,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub payload: Value,
}

impl EnvelopeDraft {
    pub fn new(kind: EventKind, actor_id: ActorId, payload: Value) -> Self {
        Self {
            event_type: kind.as_event_type(),
            actor_id,
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn kind(&self) -> Result<EventKind, UnknownEventType> {
        EventKind::parse(&self.event_type)
    }
}

/// A draft plus the values the ledger assigns before linking.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub draft: EnvelopeDraft,
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
}

/// One hash-chained ledger record.
///
/// `hash` covers the canonical JSON of every other field, `prev_hash`
/// included, so no field can change without breaking the link to the next
/// envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: EventId,
    pub event_type: String,
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub actor_id: ActorId,
    pub sequence: u64,
    pub prev_hash: Digest,
    pub hash: Digest,
    pub payload: Value,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    event_id: &'a EventId,
    event_type: &'a str,
    schema_version: u32,
    timestamp: &'a DateTime<Utc>,
    actor_id: &'a ActorId,
    sequence: u64,
    prev_hash: &'a Digest,
    payload: &'a Value,
}

impl Envelope {
    /// Recompute the hash of this envelope with `algorithm`.
    pub fn compute_hash(&self, algorithm: HashAlgorithm) -> Result<Digest, ChainError> {
        let fields = HashedFields {
            event_id: &self.event_id,
            event_type: &self.event_type,
            schema_version: self.schema_version,
            timestamp: &self.timestamp,
            actor_id: &self.actor_id,
            sequence: self.sequence,
            prev_hash: &self.prev_hash,
            payload: &self.payload,
        };
        let bytes =
            canonical_bytes(&fields).map_err(|e| ChainError::Canonicalization(e.to_string()))?;
        Ok(algorithm.digest(&bytes))
    }

    pub fn kind(&self) -> Result<EventKind, UnknownEventType> {
        EventKind::parse(&self.event_type)
    }

    /// Derived from `event_type`; never stored separately.
    pub fn branch(&self) -> Option<Branch> {
        Branch::of(&self.event_type)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 0 && self.prev_hash == Digest::GENESIS_SENTINEL
    }
}
