//! Client state and connection management.
//!
//! Admission is capped by an atomic slot counter, and every admitted client
//! gets an inactivity timer task. The timer and a real disconnect both end in
//! [`ConnectionManager::remove`], which only succeeds once per client.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Reason sent with `connection-error` when the gateway is full.
pub const CAPACITY_REASON: &str = "Connection limit exceeded.";

/// Reason sent with `connection-inactive` on eviction.
pub const INACTIVITY_REASON: &str = "Inactivity timeout";

/// Called with the id of a client whose inactivity deadline passed, after
/// the client was notified and its transport closed.
pub type ExpiryHook = Box<dyn Fn(ClientId) + Send + Sync>;

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to send messages to the client's WebSocket.
    pub tx: mpsc::Sender<Message>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Inactivity deadline, nanoseconds after the manager's epoch.
    deadline_nanos: AtomicU64,
    timer: OnceLock<AbortHandle>,
    closed: Notify,
}

impl ClientState {
    /// Create a new client state around its outbound channel.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: Utc::now(),
            deadline_nanos: AtomicU64::new(0),
            timer: OnceLock::new(),
            closed: Notify::new(),
        }
    }

    /// Time since the connection was accepted.
    pub fn connected_for(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }

    /// Create a client state together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_BUFFER_SIZE);
        (Self::new(tx), rx)
    }

    /// Send a message to this client.
    /// Uses try_send for non-blocking behavior - fails if the buffer is full.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx.try_send(Message::Text(json.into()))?;
        Ok(())
    }

    /// Send a pre-serialized frame.
    pub fn send_text(&self, json: &str) -> Result<()> {
        self.tx.try_send(Message::Text(json.to_owned().into()))?;
        Ok(())
    }

    /// Queue a close frame and wake the connection loop.
    pub fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
        self.closed.notify_one();
    }

    /// Resolves once the server has closed this client.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

/// Admission control and inactivity eviction.
pub struct ConnectionManager {
    /// Client ID → Client State.
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Reserved admission slots.
    active: AtomicUsize,
    max_connections: usize,
    inactivity_timeout: Duration,
    epoch: Instant,
    on_expire: OnceLock<ExpiryHook>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, inactivity_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            active: AtomicUsize::new(0),
            max_connections,
            inactivity_timeout,
            epoch: Instant::now(),
            on_expire: OnceLock::new(),
        }
    }

    /// Install the teardown run after an eviction. Only the first call has effect.
    pub fn set_expiry_hook(&self, hook: ExpiryHook) {
        if self.on_expire.set(hook).is_err() {
            warn!("Expiry hook already installed, ignoring");
        }
    }

    /// Admit a client and start its inactivity timer.
    ///
    /// Fails with [`GatewayError::CapacityExceeded`] when the gateway is full;
    /// the caller is expected to notify and close the client.
    pub fn admit(self: &Arc<Self>, client: Arc<ClientState>) -> Result<()> {
        let max = self.max_connections;
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            counter!("gateway_connections_rejected_total").increment(1);
            warn!("Rejecting client {}: connection limit {} reached", client.id, max);
            return Err(GatewayError::CapacityExceeded { max });
        }

        let id = client.id;
        self.set_deadline(&client, Instant::now() + self.inactivity_timeout);
        self.clients.insert(id, client.clone());

        let handle = tokio::spawn(inactivity_timer(Arc::downgrade(self), client.clone()));
        let _ = client.timer.set(handle.abort_handle());

        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").set(self.client_count() as f64);
        info!("Client {} connected", id);
        Ok(())
    }

    /// Push the client's inactivity deadline out by the full timeout.
    pub fn touch(&self, client_id: &ClientId) {
        if let Some(client) = self.clients.get(client_id) {
            self.set_deadline(&client, Instant::now() + self.inactivity_timeout);
        }
    }

    /// Unregister a client and cancel its timer.
    ///
    /// Returns the removed state; `None` means teardown already happened.
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        let (_, client) = self.clients.remove(client_id)?;
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(timer) = client.timer.get() {
            timer.abort();
        }
        gauge!("gateway_active_connections").set(self.client_count() as f64);
        info!("Client {} removed", client_id);
        Some(client)
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Ids of every connected client.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    fn set_deadline(&self, client: &ClientState, deadline: Instant) {
        let nanos = deadline.saturating_duration_since(self.epoch).as_nanos() as u64;
        client.deadline_nanos.store(nanos, Ordering::Release);
    }

    fn deadline(&self, client: &ClientState) -> Instant {
        self.epoch + Duration::from_nanos(client.deadline_nanos.load(Ordering::Acquire))
    }

    /// Notify, close and tear down a client whose deadline passed.
    fn expire(&self, client_id: ClientId) {
        let Some(client) = self.get(&client_id) else {
            return;
        };

        warn!("Disconnecting client {}: {}", client_id, GatewayError::InactivityTimeout);
        if let Err(e) = client.send(&ServerMessage::connection_inactive(INACTIVITY_REASON)) {
            debug!("Could not notify client {} of eviction: {}", client_id, e);
        }
        client.close();
        counter!("gateway_connections_evicted_total").increment(1);

        match self.on_expire.get() {
            Some(hook) => hook(client_id),
            None => {
                self.remove(&client_id);
            }
        }
    }
}

/// Sleeps until the client's deadline, re-arming whenever it was pushed out.
async fn inactivity_timer(manager: Weak<ConnectionManager>, client: Arc<ClientState>) {
    loop {
        let deadline = match manager.upgrade() {
            Some(manager) => manager.deadline(&client),
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.is_connected(&client.id) {
            return;
        }
        if Instant::now() >= manager.deadline(&client) {
            manager.expire(client.id);
            return;
        }
    }
}
