//! WebSocket protocol message types.
//!
//! Every frame in either direction is a JSON object `{"event": ..., "data": ...}`.
//! Application event names are free-form, so outgoing messages are not a
//! closed enum.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Correlates one ingress publish with all of its downstream effects.
pub type TrackingId = Uuid;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
///
/// Payloads that need an API-key check before they are inspected
/// (`publish`, `consumer-events`) are kept as raw JSON here and parsed by the
/// router after authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to an application event name.
    #[serde(rename = "subscribe")]
    Subscribe {
        event: String,
        #[serde(default)]
        api_key: String,
    },
    /// Drop an event-name subscription.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { event: String },
    /// Join a broadcast channel.
    #[serde(rename = "subscribeToChannel")]
    SubscribeToChannel {
        #[serde(default)]
        channel_id: String,
    },
    /// Leave a broadcast channel.
    #[serde(rename = "unsubscribeToChannel")]
    UnsubscribeToChannel {
        #[serde(default)]
        channel_id: String,
    },
    /// Publish an event envelope.
    #[serde(rename = "publish")]
    Publish {
        event_data: Value,
        #[serde(default)]
        api_key: String,
    },
    /// A downstream consumer handing a record back for fan-out.
    #[serde(rename = "consumer-events")]
    ConsumerEvents {
        #[serde(default)]
        metadata: Value,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        api_key: String,
    },
    /// Receive raw records of a durable-log topic.
    #[serde(rename = "subscribeToTopic")]
    SubscribeToTopic {
        topic: String,
        #[serde(default)]
        api_key: String,
    },
    /// Stop receiving records of a durable-log topic.
    #[serde(rename = "unsubscribeToTopic")]
    UnsubscribeToTopic { topic: String },
    /// Keepalive.
    #[serde(rename = "ping")]
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

pub const EVENT_SUBSCRIPTION_SUCCESS: &str = "subscription-success";
pub const EVENT_UNSUBSCRIPTION_SUCCESS: &str = "un-subscription-success";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_TRACKING_ID: &str = "trackingId";
pub const EVENT_CONNECTION_ERROR: &str = "connection-error";
pub const EVENT_CONNECTION_INACTIVE: &str = "connection-inactive";
pub const EVENT_TOPIC_RECORD: &str = "topic-record";
pub const EVENT_PUSH: &str = "push-event";
pub const EVENT_PONG: &str = "pong";

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ServerMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn subscription_success(message: impl Into<String>) -> Self {
        Self::new(EVENT_SUBSCRIPTION_SUCCESS, Value::String(message.into()))
    }

    pub fn unsubscription_success(message: impl Into<String>) -> Self {
        Self::new(EVENT_UNSUBSCRIPTION_SUCCESS, Value::String(message.into()))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(EVENT_ERROR, Value::String(reason.into()))
    }

    /// Immediate publish acknowledgement.
    pub fn tracking_id(tracking_id: TrackingId, payload: Value) -> Self {
        Self::new(
            EVENT_TRACKING_ID,
            serde_json::json!({ "trackingId": tracking_id, "payload": payload }),
        )
    }

    pub fn connection_error(reason: impl Into<String>) -> Self {
        Self::new(EVENT_CONNECTION_ERROR, Value::String(reason.into()))
    }

    pub fn connection_inactive(reason: impl Into<String>) -> Self {
        Self::new(EVENT_CONNECTION_INACTIVE, Value::String(reason.into()))
    }

    pub fn topic_record(topic: &str, record: Value) -> Self {
        Self::new(
            EVENT_TOPIC_RECORD,
            serde_json::json!({ "topic": topic, "record": record }),
        )
    }

    pub fn pong() -> Self {
        Self::new(EVENT_PONG, Value::Null)
    }
}

/// `{...payload, trackingId}`; non-object payloads are wrapped under `payload`.
pub fn with_tracking_id(payload: &Value, tracking_id: TrackingId) -> Value {
    let mut object = match payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    object.insert(
        "trackingId".to_string(),
        Value::String(tracking_id.to_string()),
    );
    Value::Object(object)
}

// ============================================================================
// Event envelope
// ============================================================================

/// `eventData` of a publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub source_number: u32,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

/// Envelope-level metadata. Unknown keys are carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<TrackingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_version: String,
    pub event_source: String,
    pub event_time: String,
    pub event_name: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_message: Option<EventMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_error: Option<EventError>,
}

/// Producers place `metadata` either beside `info` or inside it; both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<EventInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventInfoData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfoData {
    pub reference_id: String,
    pub document_id: Uuid,
    pub namespace_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<String>,
    pub activity_type: String,
    pub tracking_id: TrackingId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(GatewayError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

impl EventData {
    /// Parse and validate a raw `eventData` value.
    pub fn parse(value: Value) -> Result<Self> {
        let data: EventData = serde_json::from_value(value)
            .map_err(|e| GatewayError::Validation(format!("Malformed eventData: {}", e)))?;
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_number < 1 {
            return Err(GatewayError::Validation(
                "sourceNumber must be at least 1".to_string(),
            ));
        }
        self.payload.validate()
    }

    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.metadata.as_ref().and_then(|m| m.tracking_id)
    }

    pub fn event_name(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.event_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

impl EventPayload {
    pub fn validate(&self) -> Result<()> {
        for (i, record) in self.records.iter().enumerate() {
            record.validate().map_err(|e| {
                GatewayError::Validation(format!("records[{}]: {}", i, e.client_reason()))
            })?;
        }
        Ok(())
    }
}

impl EventRecord {
    pub fn validate(&self) -> Result<()> {
        require("eventVersion", &self.event_version)?;
        require("eventSource", &self.event_source)?;
        require("eventTime", &self.event_time)?;
        require("eventName", &self.event_name)?;
        require("eventType", &self.event_type)?;

        if let Some(message) = &self.event_message {
            if let Some(metadata) = &message.metadata {
                metadata.validate()?;
            }
            if let Some(info) = &message.info {
                if let Some(data) = &info.data {
                    require("referenceId", &data.reference_id)?;
                    require("namespaceName", &data.namespace_name)?;
                }
                if let Some(metadata) = &info.metadata {
                    metadata.validate()?;
                }
            }
        }
        Ok(())
    }
}

impl RecordMetadata {
    fn validate(&self) -> Result<()> {
        require("activityType", &self.activity_type)
    }
}

// ============================================================================
// Other ingress bodies
// ============================================================================

/// Body of the one-shot `POST /push-event` ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEventRequest {
    pub source_number: u32,
    pub channel_id: String,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl PushEventRequest {
    pub fn validate(&self) -> Result<()> {
        if self.source_number < 1 {
            return Err(GatewayError::Validation(
                "sourceNumber must be at least 1".to_string(),
            ));
        }
        require("channelId", &self.channel_id)?;
        self.payload.validate()
    }

    /// The request as a publish envelope.
    pub fn event_data(&self) -> EventData {
        EventData {
            source_number: self.source_number,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Metadata of a `consumer-events` message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerEventMetadata {
    pub tracking_id: TrackingId,
    pub event_type: String,
}

/// Value written to the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage<P> {
    pub payload: P,
    pub tracking_id: TrackingId,
}
