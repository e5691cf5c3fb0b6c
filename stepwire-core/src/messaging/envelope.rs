use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::RawMessage;
use crate::error::{MessagingError, Result};

/// JSON wrapper every message body travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    /// RFC 3339 creation time. Older producers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MessageEnvelope {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            message_type: message_type.into(),
            data,
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| MessagingError::MalformedEnvelope(err.to_string()))
    }
}

/// Broker metadata attached to every delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttributes {
    pub message_id: String,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub published_timestamp: DateTime<Utc>,
    pub redelivery_count: u32,
}

impl DeliveryAttributes {
    pub fn from_raw(message: &RawMessage) -> Self {
        let event_timestamp = match message.event_time_ms {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        };
        let published_timestamp = Utc
            .timestamp_millis_opt(message.publish_time_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            message_id: message.message_id.clone(),
            event_timestamp,
            published_timestamp,
            redelivery_count: message.redelivery_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::properties::RawProperties;

    fn raw(event_time_ms: i64) -> RawMessage {
        RawMessage {
            message_id: "tasks:7".into(),
            topic: "tasks".into(),
            payload: Vec::new(),
            properties: RawProperties::default(),
            publish_time_ms: 1_700_000_000_000,
            event_time_ms,
            redelivery_count: 2,
        }
    }

    #[test]
    fn zero_event_time_means_absent() {
        let attrs = DeliveryAttributes::from_raw(&raw(0));
        assert_eq!(attrs.event_timestamp, None);
        assert_eq!(attrs.redelivery_count, 2);
        assert_eq!(attrs.published_timestamp.timestamp_millis(), 1_700_000_000_000);

        let attrs = DeliveryAttributes::from_raw(&raw(1_600_000_000_000));
        assert_eq!(
            attrs.event_timestamp.map(|ts| ts.timestamp_millis()),
            Some(1_600_000_000_000)
        );
    }

    #[test]
    fn timestamp_is_optional_when_parsing() {
        let envelope = MessageEnvelope::from_bytes(
            br#"{"id":"m1","type":"PING","data":{"n":1}}"#,
        )
        .unwrap();
        assert_eq!(envelope.message_type, "PING");
        assert!(envelope.timestamp.is_none());
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = MessageEnvelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, MessagingError::MalformedEnvelope(_)));

        let err = MessageEnvelope::from_bytes(br#"{"id":"m1","data":{}}"#)
            .unwrap_err();
        assert!(matches!(err, MessagingError::MalformedEnvelope(_)));
    }
}
