//! Shared fixtures for unit tests.

use crate::auth::ApiKeyVerifier;
use crate::bridge::{LogBridge, LogProducer, MemoryLog};
use crate::client::{ClientState, ConnectionManager};
use crate::config::{GatewayConfig, LogBackend};
use crate::error::Result;
use crate::protocol::ServerMessage;
use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const HANDSHAKE: &str = "handshake-secret";
pub(crate) const PUBLISH_KEY: &str = "pub-key";
pub(crate) const SUBSCRIBE_KEY: &str = "sub-key";

pub(crate) fn verifier() -> ApiKeyVerifier {
    ApiKeyVerifier::new(HANDSHAKE, PUBLISH_KEY, SUBSCRIBE_KEY)
}

pub(crate) fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::new(HANDSHAKE, PUBLISH_KEY, SUBSCRIBE_KEY);
    config.max_connections = 10;
    config.inactivity_timeout = Duration::from_secs(60);
    config.log.backend = LogBackend::Memory;
    config.log.inbound_topics = vec!["notifications".to_string()];
    config
}

pub(crate) fn memory_bridge() -> (Arc<LogBridge>, Arc<MemoryLog>) {
    let log = Arc::new(MemoryLog::new());
    (Arc::new(LogBridge::new(log.clone(), log.clone())), log)
}

/// Admit a fresh client and hand back its outbound receiver.
pub(crate) fn admitted_client(
    connections: &Arc<ConnectionManager>,
) -> (Arc<ClientState>, mpsc::Receiver<Message>) {
    let (client, rx) = ClientState::channel();
    let client = Arc::new(client);
    connections
        .admit(client.clone())
        .expect("test connection manager has capacity");
    (client, rx)
}

/// Every text frame queued so far, decoded.
pub(crate) fn drain_events(rx: &mut mpsc::Receiver<Message>) -> Vec<ServerMessage> {
    let mut events = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            events.push(serde_json::from_str(text.as_str()).expect("server frames are JSON"));
        }
    }
    events
}

pub(crate) fn record_json(event_name: &str) -> Value {
    json!({
        "eventVersion": "1.0",
        "eventSource": "bpms",
        "eventTime": "2024-01-01T00:00:00Z",
        "eventName": event_name,
        "eventType": "document",
        "eventMessage": {
            "info": {
                "data": {
                    "referenceId": "REF-1",
                    "documentId": "6f1c0f8e-2b5a-4a57-9f5e-2d4a3c1b0e9a",
                    "namespaceName": "contracts"
                }
            },
            "metadata": {
                "activityType": "upload",
                "trackingId": "0b6c1b3e-4f39-4d0e-9a52-8f9b1f0f3a11"
            }
        }
    })
}

pub(crate) fn event_data(source_number: u32, event_names: &[&str]) -> Value {
    let records: Vec<Value> = event_names.iter().map(|name| record_json(name)).collect();
    json!({ "sourceNumber": source_number, "payload": { "records": records } })
}

/// Producer whose broker is always down.
pub(crate) struct UnavailableProducer;

#[async_trait]
impl LogProducer for UnavailableProducer {
    async fn send(&self, _topic: &str, _value: Bytes) -> Result<()> {
        Err(anyhow::anyhow!("broker unreachable").into())
    }
}
