//! Event router: classifies published events by source and either writes
//! them to the durable log or fans them out to subscribers in memory.

use crate::auth::ApiKeyVerifier;
use crate::bridge::{InboundRecord, LogBridge};
use crate::client::{ClientState, ConnectionManager};
use crate::error::{GatewayError, Result};
use crate::protocol::{
    with_tracking_id, ConsumerEventMetadata, EventData, LogMessage, PushEventRequest,
    ServerMessage, TrackingId, EVENT_PUSH,
};
use crate::subscription::SubscriptionRegistry;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happens to an event from a given source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTag {
    /// Appended to the durable log.
    Durable,
    /// Delivered in memory under the envelope's `metadata.eventName`.
    DirectRelay,
    /// Each record delivered in memory under its own `eventName`.
    Default,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Durable => "durable",
            SourceTag::DirectRelay => "direct_relay",
            SourceTag::Default => "default",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from `sourceNumber` to [`SourceTag`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    tags: HashMap<u32, SourceTag>,
}

impl Default for SourceTable {
    fn default() -> Self {
        Self {
            tags: HashMap::from([
                (1, SourceTag::Durable),
                (2, SourceTag::Durable),
                (3, SourceTag::DirectRelay),
                (4, SourceTag::Default),
            ]),
        }
    }
}

impl SourceTable {
    /// Build a table; a number may appear under one tag only.
    pub fn new(durable: Vec<u32>, direct_relay: Vec<u32>, default: Vec<u32>) -> Result<Self> {
        let mut tags = HashMap::new();
        let groups = [
            (SourceTag::Durable, durable),
            (SourceTag::DirectRelay, direct_relay),
            (SourceTag::Default, default),
        ];
        for (tag, numbers) in groups {
            for number in numbers {
                if number == 0 {
                    return Err(GatewayError::Config(
                        "source numbers start at 1".to_string(),
                    ));
                }
                if let Some(previous) = tags.insert(number, tag) {
                    if previous != tag {
                        return Err(GatewayError::Config(format!(
                            "source number {} mapped to both {} and {}",
                            number, previous, tag
                        )));
                    }
                }
            }
        }
        Ok(Self { tags })
    }

    pub fn classify(&self, source_number: u32) -> Result<SourceTag> {
        self.tags.get(&source_number).copied().ok_or_else(|| {
            GatewayError::Validation(format!("Unknown sourceNumber: {}", source_number))
        })
    }

    /// Numbers mapped to `tag`, ascending.
    pub fn numbers(&self, tag: SourceTag) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .tags
            .iter()
            .filter(|(_, t)| **t == tag)
            .map(|(n, _)| *n)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

/// Routes publishes from sockets, the push endpoint and inbound log topics.
pub struct EventRouter {
    verifier: ApiKeyVerifier,
    sources: SourceTable,
    durable_topic: String,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    bridge: Arc<LogBridge>,
}

impl EventRouter {
    pub fn new(
        verifier: ApiKeyVerifier,
        sources: SourceTable,
        durable_topic: impl Into<String>,
        connections: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        bridge: Arc<LogBridge>,
    ) -> Self {
        Self {
            verifier,
            sources,
            durable_topic: durable_topic.into(),
            connections,
            registry,
            bridge,
        }
    }

    /// Handle a socket `publish`.
    ///
    /// The publisher receives a `trackingId` acknowledgement before the event
    /// is dispatched, so the ack is sent even when dispatch later fails.
    pub async fn publish(
        &self,
        client: &ClientState,
        event_data: Value,
        api_key: &str,
    ) -> Result<TrackingId> {
        if let Err(e) = self.verifier.verify_publish(api_key) {
            warn!("Rejected publish from client {}: invalid API key", client.id);
            return Err(e);
        }
        self.connections.touch(&client.id);

        let data = EventData::parse(event_data)?;
        let tag = self.check_dispatchable(&data)?;
        let tracking_id = data.tracking_id().unwrap_or_else(Uuid::new_v4);
        let payload = serde_json::to_value(&data)?;

        client.send(&ServerMessage::tracking_id(tracking_id, payload.clone()))?;
        self.dispatch(tag, &data, &payload, tracking_id).await?;
        Ok(tracking_id)
    }

    /// Handle `POST /push-event`: dispatch like a publish, then broadcast the
    /// request to the channel it names. The caller has already checked the key.
    pub async fn route_push(&self, request: PushEventRequest) -> Result<TrackingId> {
        request.validate()?;
        let data = request.event_data();
        let tag = self.check_dispatchable(&data)?;
        let tracking_id = data.tracking_id().unwrap_or_else(Uuid::new_v4);
        let payload = serde_json::to_value(&data)?;

        self.dispatch(tag, &data, &payload, tracking_id).await?;

        let body = with_tracking_id(&serde_json::to_value(&request)?, tracking_id);
        self.registry
            .broadcast_to_channel(&self.connections, &request.channel_id, EVENT_PUSH, &body);
        Ok(tracking_id)
    }

    /// Handle `consumer-events`: relay `payload` to subscribers of
    /// `metadata.eventType`, keeping the producer's tracking id.
    pub fn relay_consumer_event(
        &self,
        client: &ClientState,
        metadata: Value,
        payload: Value,
        api_key: &str,
    ) -> Result<TrackingId> {
        if let Err(e) = self.verifier.verify_publish(api_key) {
            warn!("Rejected consumer event from client {}: invalid API key", client.id);
            return Err(e);
        }
        self.connections.touch(&client.id);

        let metadata: ConsumerEventMetadata = serde_json::from_value(metadata)
            .map_err(|e| GatewayError::Validation(format!("Malformed metadata: {}", e)))?;
        if metadata.event_type.trim().is_empty() {
            return Err(GatewayError::Validation("eventType must not be empty".to_string()));
        }

        counter!("gateway_publish_total", "source" => "consumer").increment(1);
        self.registry.fanout_by_event_name(
            &self.connections,
            &metadata.event_type,
            &payload,
            metadata.tracking_id,
        );
        Ok(metadata.tracking_id)
    }

    /// Fan out a record read from an inbound log topic.
    ///
    /// Gateway-shaped messages whose payload is an event envelope are
    /// delivered per record; a payload carrying its own `eventName` is
    /// delivered as is. Anything else is dropped.
    pub fn route_inbound(&self, topic: &str, record: &InboundRecord) -> usize {
        let InboundRecord::Message(message) = record else {
            warn!("Dropping non-event record on inbound topic {}", topic);
            return 0;
        };

        if let Ok(data) = serde_json::from_value::<EventData>(message.payload.clone()) {
            return self.fanout_records(&data, message.tracking_id);
        }

        match message.payload.get("eventName").and_then(Value::as_str) {
            Some(event) if !event.is_empty() => self.registry.fanout_by_event_name(
                &self.connections,
                event,
                &message.payload,
                message.tracking_id,
            ),
            _ => {
                warn!("Record on inbound topic {} has no event name", topic);
                0
            }
        }
    }

    /// Reject envelopes that could not be dispatched, before anything is
    /// acknowledged.
    fn check_dispatchable(&self, data: &EventData) -> Result<SourceTag> {
        let tag = self.sources.classify(data.source_number)?;
        if tag == SourceTag::DirectRelay && data.event_name().is_none() {
            return Err(GatewayError::Validation(
                "metadata.eventName is required for this sourceNumber".to_string(),
            ));
        }
        Ok(tag)
    }

    async fn dispatch(
        &self,
        tag: SourceTag,
        data: &EventData,
        payload: &Value,
        tracking_id: TrackingId,
    ) -> Result<()> {
        counter!("gateway_publish_total", "source" => tag.as_str()).increment(1);

        match tag {
            SourceTag::Durable => {
                let message = LogMessage { payload, tracking_id };
                self.bridge.publish(&self.durable_topic, &message).await?;
                info!(
                    "Message sent to topic {} with trackingId: {}",
                    self.durable_topic, tracking_id
                );
            }
            SourceTag::DirectRelay => {
                let event = data.event_name().ok_or_else(|| {
                    GatewayError::Validation("metadata.eventName is required".to_string())
                })?;
                let records = serde_json::to_value(&data.payload)?;
                self.registry
                    .fanout_by_event_name(&self.connections, event, &records, tracking_id);
            }
            SourceTag::Default => {
                self.fanout_records(data, tracking_id);
            }
        }
        Ok(())
    }

    fn fanout_records(&self, data: &EventData, tracking_id: TrackingId) -> usize {
        if data.payload.records.is_empty() {
            debug!("Envelope {} carries no records", tracking_id);
            return 0;
        }

        let mut delivered = 0;
        for record in &data.payload.records {
            match serde_json::to_value(record) {
                Ok(value) => {
                    delivered += self.registry.fanout_by_event_name(
                        &self.connections,
                        &record.event_name,
                        &value,
                        tracking_id,
                    );
                }
                Err(e) => warn!("Failed to serialize record {}: {}", record.event_name, e),
            }
        }
        delivered
    }
}
