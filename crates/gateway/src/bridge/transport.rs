//! Durable log seam: what the bridge needs from a log client.

use crate::error::Result;
use crate::protocol::LogMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

/// One record read from a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub value: Bytes,
}

/// Records of the currently subscribed topic set.
pub type RecordStream = BoxStream<'static, Result<LogRecord>>;

/// Write side of the log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append `value` to `topic`, returning once the log acknowledged it.
    async fn send(&self, topic: &str, value: Bytes) -> Result<()>;
}

/// Read side of the log, driven by a single consumer group.
///
/// A running subscription cannot be extended with another topic; callers
/// drop the current stream and subscribe again with the full topic set.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Subscribe the group to exactly `topics` and return their records,
    /// starting at the group's committed position for each topic.
    async fn subscribe(&self, topics: &[String]) -> Result<RecordStream>;

    /// Halt delivery of `topic` without giving up its committed position.
    async fn pause(&self, topic: &str) -> Result<()>;
}

/// A record as handed to bridge subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRecord {
    /// Value in the gateway's `{payload, trackingId}` shape.
    Message(LogMessage<Value>),
    /// Any other JSON document.
    Json(Value),
    /// Not JSON at all, delivered as text rather than dropped.
    Raw(String),
}

impl InboundRecord {
    pub fn parse(value: &[u8]) -> Self {
        if let Ok(message) = serde_json::from_slice::<LogMessage<Value>>(value) {
            return InboundRecord::Message(message);
        }
        match serde_json::from_slice::<Value>(value) {
            Ok(json) => InboundRecord::Json(json),
            Err(_) => InboundRecord::Raw(String::from_utf8_lossy(value).into_owned()),
        }
    }

    /// JSON form for forwarding to clients.
    pub fn to_value(&self) -> Value {
        match self {
            InboundRecord::Message(message) => {
                serde_json::to_value(message).unwrap_or(Value::Null)
            }
            InboundRecord::Json(json) => json.clone(),
            InboundRecord::Raw(text) => Value::String(text.clone()),
        }
    }
}

/// Delivery callback registered per (topic, subscriber).
pub type RecordCallback = Arc<dyn Fn(&str, &InboundRecord) + Send + Sync>;
