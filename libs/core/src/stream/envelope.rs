//! Stream envelopes: the unit of data carried by the event
//! stream fan-out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Reset,
    Delta,
    Heartbeat,
    Error,
}

/// One unit of a stream: sequence, kind, payload, timestamp. Sequences are
/// monotonically increasing within a single stream source.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEnvelope {
    pub sequence: u64,
    pub kind: EnvelopeKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEnvelope {
    pub fn new(sequence: u64, kind: EnvelopeKind, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            kind,
            payload,
            timestamp,
        }
    }

    pub fn heartbeat(sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self::new(sequence, EnvelopeKind::Heartbeat, Value::Null, timestamp)
    }

    pub fn error(sequence: u64, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            sequence,
            EnvelopeKind::Error,
            Value::String(message.into()),
            timestamp,
        )
    }

    pub fn reset(sequence: u64, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self::new(sequence, EnvelopeKind::Reset, payload, timestamp)
    }

    pub fn delta(sequence: u64, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self::new(sequence, EnvelopeKind::Delta, payload, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_carries_no_payload() {
        let envelope = StreamEnvelope::heartbeat(3, Utc::now());
        assert_eq!(envelope.kind, EnvelopeKind::Heartbeat);
        assert_eq!(envelope.payload, Value::Null);
        assert_eq!(envelope.sequence, 3);
    }

    #[test]
    fn error_wraps_the_message_as_a_string_payload() {
        let envelope = StreamEnvelope::error(1, "rebuild failed", Utc::now());
        assert_eq!(envelope.kind, EnvelopeKind::Error);
        assert_eq!(envelope.payload, Value::String("rebuild failed".to_string()));
    }

    #[test]
    fn reset_and_delta_preserve_the_given_payload_and_kind() {
        let payload = serde_json::json!({ "items": [] });
        let reset = StreamEnvelope::reset(0, payload.clone(), Utc::now());
        assert_eq!(reset.kind, EnvelopeKind::Reset);
        assert_eq!(reset.payload, payload);

        let delta = StreamEnvelope::delta(1, payload.clone(), Utc::now());
        assert_eq!(delta.kind, EnvelopeKind::Delta);
        assert_eq!(delta.payload, payload);
    }

    #[test]
    fn kind_serializes_as_lowercase() {
        assert_eq!(serde_json::to_string(&EnvelopeKind::Heartbeat).unwrap(), "\"heartbeat\"");
        assert_eq!(serde_json::to_string(&EnvelopeKind::Reset).unwrap(), "\"reset\"");
    }
}
