//! Event-name subscriptions and channel membership.
//!
//! Two independent structures:
//! - event subscriptions: client → event names, with a reverse index
//!   event name → clients so fan-out does not scan every connection
//! - channels: channel id → member clients, used for room-style broadcast
//!
//! Neither keeps empty sets around: the last removal drops the key.

use crate::auth::ApiKeyVerifier;
use crate::client::{ClientId, ClientState, ConnectionManager};
use crate::error::{GatewayError, Result};
use crate::protocol::{with_tracking_id, ServerMessage, TrackingId};
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct EventIndex {
    by_client: HashMap<ClientId, HashSet<String>>,
    by_event: HashMap<String, HashSet<ClientId>>,
}

impl EventIndex {
    fn insert(&mut self, client_id: ClientId, event: &str) -> bool {
        let added = self
            .by_client
            .entry(client_id)
            .or_default()
            .insert(event.to_string());
        self.by_event
            .entry(event.to_string())
            .or_default()
            .insert(client_id);
        added
    }

    fn remove(&mut self, client_id: &ClientId, event: &str) -> bool {
        let Some(events) = self.by_client.get_mut(client_id) else {
            return false;
        };
        if !events.remove(event) {
            return false;
        }
        if events.is_empty() {
            self.by_client.remove(client_id);
        }
        self.unlink(client_id, event);
        true
    }

    fn remove_client(&mut self, client_id: &ClientId) -> usize {
        let Some(events) = self.by_client.remove(client_id) else {
            return 0;
        };
        for event in &events {
            self.unlink(client_id, event);
        }
        events.len()
    }

    fn unlink(&mut self, client_id: &ClientId, event: &str) {
        if let Some(clients) = self.by_event.get_mut(event) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.by_event.remove(event);
            }
        }
    }
}

/// Per-connection event subscriptions and channel membership.
pub struct SubscriptionRegistry {
    verifier: ApiKeyVerifier,
    events: RwLock<EventIndex>,
    /// Channel ID → member client IDs.
    channels: DashMap<String, HashSet<ClientId>>,
}

impl SubscriptionRegistry {
    pub fn new(verifier: ApiKeyVerifier) -> Self {
        Self {
            verifier,
            events: RwLock::new(EventIndex::default()),
            channels: DashMap::new(),
        }
    }

    /// Subscribe a client to an event name after checking its API key.
    pub fn subscribe_event(&self, client: &ClientState, event: &str, api_key: &str) -> Result<()> {
        if let Err(e) = self.verifier.verify_subscribe(api_key) {
            warn!("Subscription failed for client {}: {}", client.id, e);
            return Err(e);
        }
        if event.trim().is_empty() {
            return Err(GatewayError::Validation("Event name is required".to_string()));
        }

        let added = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id, event);
        if added {
            counter!("gateway_subscriptions_total").increment(1);
        }

        info!("Client {} subscribed to event: {}", client.id, event);
        client.send(&ServerMessage::subscription_success(format!(
            "Subscribed to event: {}",
            event
        )))
    }

    /// Drop an event subscription; unknown subscriptions are reported to the client.
    pub fn unsubscribe_event(&self, client: &ClientState, event: &str) -> Result<()> {
        let removed = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client.id, event);
        if !removed {
            return Err(GatewayError::Validation(format!(
                "Not subscribed to event: {}",
                event
            )));
        }

        info!("Client {} unsubscribed from event: {}", client.id, event);
        client.send(&ServerMessage::unsubscription_success(format!(
            "Unsubscribed from event: {}",
            event
        )))
    }

    /// Join a channel.
    pub fn subscribe_channel(&self, client: &ClientState, channel_id: &str) -> Result<()> {
        if channel_id.trim().is_empty() {
            return Err(GatewayError::Validation("Channel ID is required".to_string()));
        }

        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(client.id);

        info!("Client {} subscribed to channel: {}", client.id, channel_id);
        client.send(&ServerMessage::subscription_success(format!(
            "Subscribed to channel: {}",
            channel_id
        )))
    }

    /// Leave a channel.
    pub fn unsubscribe_channel(&self, client: &ClientState, channel_id: &str) -> Result<()> {
        let removed = match self.channels.get_mut(channel_id) {
            Some(mut members) => members.remove(&client.id),
            None => false,
        };
        if !removed {
            return Err(GatewayError::Validation(
                "Invalid channel ID or not subscribed".to_string(),
            ));
        }
        self.channels.remove_if(channel_id, |_, members| members.is_empty());

        info!("Client {} unsubscribed from channel: {}", client.id, channel_id);
        client.send(&ServerMessage::unsubscription_success(format!(
            "Unsubscribed from channel: {}",
            channel_id
        )))
    }

    /// Deliver `event` to every client subscribed to it, point-to-point.
    ///
    /// Each recipient gets `{...payload, trackingId}`. A failed delivery is
    /// logged and the remaining recipients are still served. Returns the
    /// number of successful deliveries.
    pub fn fanout_by_event_name(
        &self,
        connections: &ConnectionManager,
        event: &str,
        payload: &Value,
        tracking_id: TrackingId,
    ) -> usize {
        let targets: Vec<ClientId> = {
            let index = self.events.read().unwrap_or_else(PoisonError::into_inner);
            match index.by_event.get(event) {
                Some(clients) => clients.iter().copied().collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            warn!("No clients are subscribed to event: {}", event);
            return 0;
        }

        info!(
            "Publishing event: {} to {} clients with trackingId: {}",
            event,
            targets.len(),
            tracking_id
        );

        let message = ServerMessage::new(event, with_tracking_id(payload, tracking_id));
        self.deliver(connections, &targets, &message)
    }

    /// Deliver `event` with `payload` to every member of a channel.
    pub fn broadcast_to_channel(
        &self,
        connections: &ConnectionManager,
        channel_id: &str,
        event: &str,
        payload: &Value,
    ) -> usize {
        let members: Vec<ClientId> = match self.channels.get(channel_id) {
            Some(members) => members.iter().copied().collect(),
            None => Vec::new(),
        };

        if members.is_empty() {
            warn!("No subscribers found for channel: {}", channel_id);
            return 0;
        }

        let message = ServerMessage::new(event, payload.clone());
        let delivered = self.deliver(connections, &members, &message);
        info!("Broadcasted event '{}' to channel: {}", event, channel_id);
        delivered
    }

    fn deliver(
        &self,
        connections: &ConnectionManager,
        targets: &[ClientId],
        message: &ServerMessage,
    ) -> usize {
        // Pre-serialize once
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event '{}': {}", message.event, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for client_id in targets {
            let Some(client) = connections.get(client_id) else {
                debug!("Skipping departed client {}", client_id);
                continue;
            };
            match client.send_text(&json) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to emit event: {} to client: {}. Error: {}",
                    message.event, client_id, e
                ),
            }
        }
        counter!("gateway_fanout_deliveries_total").increment(delivered as u64);
        delivered
    }

    /// Purge every event subscription and channel membership of a client.
    pub fn remove_client(&self, client_id: &ClientId) {
        let events = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_client(client_id);

        let mut channels = 0;
        self.channels.retain(|_, members| {
            if members.remove(client_id) {
                channels += 1;
            }
            !members.is_empty()
        });

        debug!(
            "Purged client {}: {} event subscriptions, {} channels",
            client_id, events, channels
        );
    }

    pub fn is_subscribed(&self, client_id: &ClientId, event: &str) -> bool {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_client
            .get(client_id)
            .is_some_and(|events| events.contains(event))
    }

    pub fn is_channel_member(&self, client_id: &ClientId, channel_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|members| members.contains(client_id))
    }

    /// Number of distinct subscribed event names.
    pub fn subscription_count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_event
            .len()
    }

    /// Number of clients with at least one event subscription.
    pub fn subscriber_count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_client
            .len()
    }

    /// Number of channels with at least one member.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
