//! Gateway frontend: owns the connection manager, the subscription registry,
//! the router and the log bridge, and dispatches client messages to them.

use crate::auth::ApiKeyVerifier;
use crate::bridge::{InboundRecord, LogBridge, RecordCallback};
use crate::client::{ClientId, ClientState, ConnectionManager, CAPACITY_REASON};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::router::EventRouter;
use crate::subscription::SubscriptionRegistry;
use metrics::counter;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Bridge subscriber id used for the gateway's own inbound topics.
const INBOUND_SUBSCRIBER: &str = "gateway-inbound";

pub struct Gateway {
    config: GatewayConfig,
    verifier: ApiKeyVerifier,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    bridge: Arc<LogBridge>,
    router: EventRouter,
}

impl Gateway {
    pub fn new(config: GatewayConfig, bridge: Arc<LogBridge>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Gateway>| {
            let verifier = ApiKeyVerifier::new(
                config.handshake_token.clone(),
                config.publish_key.clone(),
                config.subscribe_key.clone(),
            );

            let connections = Arc::new(ConnectionManager::new(
                config.max_connections,
                config.inactivity_timeout,
            ));
            let gateway = weak.clone();
            connections.set_expiry_hook(Box::new(move |client_id| {
                if let Some(gateway) = gateway.upgrade() {
                    gateway.disconnect(&client_id);
                }
            }));

            let registry = Arc::new(SubscriptionRegistry::new(verifier.clone()));
            let router = EventRouter::new(
                verifier.clone(),
                config.sources.clone(),
                config.log.durable_topic.clone(),
                connections.clone(),
                registry.clone(),
                bridge.clone(),
            );

            Self {
                config,
                verifier,
                connections,
                registry,
                bridge,
                router,
            }
        })
    }

    /// Subscribe the gateway to its inbound topics. Failure here is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for topic in &self.config.log.inbound_topics {
            let gateway = Arc::downgrade(self);
            let callback: RecordCallback = Arc::new(move |topic: &str, record: &InboundRecord| {
                if let Some(gateway) = gateway.upgrade() {
                    gateway.router.route_inbound(topic, record);
                }
            });
            self.bridge
                .subscribe(INBOUND_SUBSCRIBER, topic, callback)
                .await?;
            info!("Consuming inbound topic {}", topic);
        }
        Ok(())
    }

    /// Close every client and stop log consumption.
    pub async fn shutdown(&self) {
        for client_id in self.connections.client_ids() {
            if let Some(client) = self.connections.get(&client_id) {
                client.close();
            }
        }
        self.bridge.shutdown().await;
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn verifier(&self) -> &ApiKeyVerifier {
        &self.verifier
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<LogBridge> {
        &self.bridge
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Admit a new connection. On rejection the client has already been sent
    /// `connection-error` and a close frame.
    pub fn connect(&self, client: Arc<ClientState>) -> Result<()> {
        match self.connections.admit(client.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let GatewayError::CapacityExceeded { .. } = e {
                    let _ = client.send(&ServerMessage::connection_error(CAPACITY_REASON));
                }
                client.close();
                Err(e)
            }
        }
    }

    /// Tear down a connection. Safe to call more than once; only the first
    /// call has an effect.
    pub fn disconnect(&self, client_id: &ClientId) {
        let Some(client) = self.connections.remove(client_id) else {
            return;
        };
        self.registry.remove_client(client_id);

        let subscriber = client_id.to_string();
        if self.bridge.has_subscriber(&subscriber) {
            let bridge = self.bridge.clone();
            tokio::spawn(async move {
                bridge.unsubscribe_all(&subscriber).await;
            });
        }
        info!(
            "Client {} disconnected after {}s",
            client_id,
            client.connected_for().num_seconds()
        );
    }

    /// Handle one text frame from a client.
    pub async fn handle_text(&self, client: &Arc<ClientState>, text: &str) {
        self.connections.touch(&client.id);

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(client, msg).await,
            Err(e) => {
                debug!("Invalid message from client {}: {}", client.id, e);
                self.reply_error(client, &GatewayError::Json(e));
            }
        }
    }

    /// Dispatch a parsed client message. Errors are reported to the sender only.
    pub async fn handle_message(&self, client: &Arc<ClientState>, msg: ClientMessage) {
        if !self.connections.is_connected(&client.id) {
            let e = GatewayError::ClientNotFound(client.id.to_string());
            debug!("Ignoring message: {}", e);
            return;
        }
        counter!("gateway_messages_received_total").increment(1);

        let result = self.dispatch(client, msg).await;

        // Teardown may have run while the message was in flight; its purge
        // can precede an insert made above.
        if !self.connections.is_connected(&client.id) {
            self.registry.remove_client(&client.id);
            return;
        }
        if let Err(e) = result {
            self.reply_error(client, &e);
        }
    }

    async fn dispatch(&self, client: &Arc<ClientState>, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Subscribe { event, api_key } => {
                self.registry.subscribe_event(client, &event, &api_key)
            }
            ClientMessage::Unsubscribe { event } => self.registry.unsubscribe_event(client, &event),
            ClientMessage::SubscribeToChannel { channel_id } => {
                self.registry.subscribe_channel(client, &channel_id)
            }
            ClientMessage::UnsubscribeToChannel { channel_id } => {
                self.registry.unsubscribe_channel(client, &channel_id)
            }
            ClientMessage::Publish {
                event_data,
                api_key,
            } => self
                .router
                .publish(client, event_data, &api_key)
                .await
                .map(|_| ()),
            ClientMessage::ConsumerEvents {
                metadata,
                payload,
                api_key,
            } => self
                .router
                .relay_consumer_event(client, metadata, payload, &api_key)
                .map(|_| ()),
            ClientMessage::SubscribeToTopic { topic, api_key } => {
                self.subscribe_topic(client, &topic, &api_key).await
            }
            ClientMessage::UnsubscribeToTopic { topic } => {
                self.unsubscribe_topic(client, &topic).await
            }
            ClientMessage::Ping => client.send(&ServerMessage::pong()),
        }
    }

    /// Forward records of a log topic to this client as `topic-record` events.
    async fn subscribe_topic(
        &self,
        client: &Arc<ClientState>,
        topic: &str,
        api_key: &str,
    ) -> Result<()> {
        self.verifier.verify_subscribe(api_key)?;
        if topic.trim().is_empty() {
            return Err(GatewayError::Validation("Topic is required".to_string()));
        }

        let connections = Arc::downgrade(&self.connections);
        let client_id = client.id;
        let callback: RecordCallback = Arc::new(move |topic: &str, record: &InboundRecord| {
            let Some(client) = connections.upgrade().and_then(|c| c.get(&client_id)) else {
                return;
            };
            if let Err(e) = client.send(&ServerMessage::topic_record(topic, record.to_value())) {
                warn!("Failed to forward record on {} to client {}: {}", topic, client_id, e);
            }
        });

        let subscriber = client.id.to_string();
        self.bridge.subscribe(&subscriber, topic, callback).await?;

        // The client may have gone away while the bridge was resubscribing.
        if !self.connections.is_connected(&client.id) {
            self.bridge.unsubscribe(&subscriber, topic).await;
            return Ok(());
        }
        client.send(&ServerMessage::subscription_success(format!(
            "Subscribed to topic: {}",
            topic
        )))
    }

    async fn unsubscribe_topic(&self, client: &Arc<ClientState>, topic: &str) -> Result<()> {
        if !self.bridge.unsubscribe(&client.id.to_string(), topic).await {
            return Err(GatewayError::Validation(format!(
                "Not subscribed to topic: {}",
                topic
            )));
        }
        client.send(&ServerMessage::unsubscription_success(format!(
            "Unsubscribed from topic: {}",
            topic
        )))
    }

    fn reply_error(&self, client: &ClientState, e: &GatewayError) {
        if e.is_client_error() {
            warn!("Request from client {} failed: {}", client.id, e);
        } else {
            error!("Request from client {} failed: {}", client.id, e);
        }
        counter!("gateway_client_errors_total").increment(1);
        if let Err(send_err) = client.send(&ServerMessage::error(e.client_reason())) {
            debug!("Could not report error to client {}: {}", client.id, send_err);
        }
    }
}
