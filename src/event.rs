//! Event envelope types and the JSON payload codec.
//!
//! The runtime exchanges events as opaque `(metadata, payload-bytes)` pairs.
//! Payloads are encoded with `serde_json`; nothing outside this module needs
//! to know the byte format.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

/// Sentinel for "no sequence yet": an empty log, a new aggregate, or a view
/// that has processed nothing.
pub const NO_SEQUENCE: i64 = -1;

/// Metadata carried alongside every event.
///
/// Fields are optional because events are built up in stages: an aggregate
/// fills in identity and local sequence when emitting, the command processor
/// assigns the global sequence and timestamp, and the store stamps the batch
/// id. An event is only persisted once every required field is present (see
/// [`EventData::is_complete`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Id of the aggregate that emitted the event.
    pub aggregate_id: Option<String>,
    /// Zero-based position within the aggregate's own stream.
    pub local_sequence: Option<i64>,
    /// Position in the log-wide total order.
    pub global_sequence: Option<i64>,
    /// Owner tag of the emitting aggregate type (see [`Aggregate::OWNER`](crate::Aggregate::OWNER)).
    pub owner: Option<String>,
    /// Event type tag (see [`DomainEvent::EVENT_TYPE`](crate::DomainEvent::EVENT_TYPE)).
    pub event_type: Option<String>,
    /// Id of the batch the event was committed in.
    pub batch_id: Option<Uuid>,
    /// Commit time, milliseconds since the Unix epoch.
    pub time_utc: Option<u64>,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form metadata from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// An immutable event: metadata plus encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Identity, ordering and provenance of the event.
    pub meta: EventMetadata,
    /// Encoded domain event.
    pub payload: Vec<u8>,
}

impl EventData {
    /// Create an event from its metadata and encoded payload.
    pub fn new(meta: EventMetadata, payload: Vec<u8>) -> Self {
        Self { meta, payload }
    }

    /// Returns `true` when every required metadata field is set.
    ///
    /// Required: aggregate id, local sequence, global sequence, owner tag,
    /// event type tag, batch id and commit time.
    pub fn is_complete(&self) -> bool {
        let m = &self.meta;
        m.aggregate_id.is_some()
            && m.local_sequence.is_some()
            && m.global_sequence.is_some()
            && m.owner.is_some()
            && m.event_type.is_some()
            && m.batch_id.is_some()
            && m.time_utc.is_some()
    }

    /// Aggregate id, or `""` if not yet assigned.
    pub fn aggregate_id(&self) -> &str {
        self.meta.aggregate_id.as_deref().unwrap_or_default()
    }

    /// Local sequence, or [`NO_SEQUENCE`] if not yet assigned.
    pub fn local_sequence(&self) -> i64 {
        self.meta.local_sequence.unwrap_or(NO_SEQUENCE)
    }

    /// Global sequence, or [`NO_SEQUENCE`] if not yet assigned.
    pub fn global_sequence(&self) -> i64 {
        self.meta.global_sequence.unwrap_or(NO_SEQUENCE)
    }

    /// Event type tag, or `""` if not yet assigned.
    pub fn event_type(&self) -> &str {
        self.meta.event_type.as_deref().unwrap_or_default()
    }

    /// Owner tag, or `""` if not yet assigned.
    pub fn owner(&self) -> &str {
        self.meta.owner.as_deref().unwrap_or_default()
    }

    /// Decode the payload into a concrete domain event.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the bytes do not match `E`'s shape.
    pub fn decode<E: DeserializeOwned>(&self) -> serde_json::Result<E> {
        decode_payload(&self.payload)
    }
}

/// Encode a domain event into payload bytes.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized.
pub fn encode_payload<E: Serialize>(event: &E) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(event)
}

/// Decode payload bytes back into a domain event.
///
/// # Errors
///
/// Returns `serde_json::Error` if the bytes are not valid JSON for `E`.
pub fn decode_payload<E: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<E> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a fully stamped event with an empty JSON object payload.
    pub(crate) fn stored(aggregate_id: &str, local: i64, global: i64) -> EventData {
        EventData::new(
            EventMetadata {
                aggregate_id: Some(aggregate_id.to_owned()),
                local_sequence: Some(local),
                global_sequence: Some(global),
                owner: Some("test".to_owned()),
                event_type: Some("Touched".to_owned()),
                batch_id: Some(Uuid::nil()),
                time_utc: Some(0),
                ..EventMetadata::default()
            },
            b"{}".to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::stored;
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: u64,
    }

    #[test]
    fn payload_codec_preserves_fields() {
        let bytes = encode_payload(&Deposited { amount: 7 }).expect("encode should succeed");
        let decoded: Deposited = decode_payload(&bytes).expect("decode should succeed");
        assert_eq!(decoded, Deposited { amount: 7 });
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let result = decode_payload::<Deposited>(b"{\"other\": true}");
        assert!(result.is_err());
    }

    #[test]
    fn stamped_event_is_complete() {
        assert!(stored("a", 0, 0).is_complete());
    }

    #[test]
    fn missing_batch_id_is_incomplete() {
        let mut event = stored("a", 0, 0);
        event.meta.batch_id = None;
        assert!(!event.is_complete());
    }

    #[test]
    fn accessors_fall_back_to_sentinels() {
        let event = EventData::new(EventMetadata::default(), Vec::new());
        assert_eq!(event.aggregate_id(), "");
        assert_eq!(event.local_sequence(), NO_SEQUENCE);
        assert_eq!(event.global_sequence(), NO_SEQUENCE);
        assert_eq!(event.event_type(), "");
    }

    #[test]
    fn optional_context_fields_are_omitted_when_absent() {
        let json = serde_json::to_value(stored("a", 0, 0).meta).expect("serialize");
        assert!(json.get("actor").is_none());
        assert!(json.get("extra").is_none());
        assert_eq!(json["aggregate_id"], "a");
    }
}
