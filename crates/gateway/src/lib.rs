//! Real-time event gateway.
//!
//! This service:
//! - Accepts authenticated WebSocket connections, capped in number and
//!   evicted after a period of inactivity
//! - Keeps per-connection event subscriptions and channel memberships
//! - Routes published events by source, either to the durable log or
//!   straight to subscribers
//! - Consumes log topics and fans their records out to subscribers
//!
//! ## Architecture
//!
//! ```text
//! WebSocket / POST /push-event
//!         ↓
//! Gateway ── ConnectionManager (admission, inactivity timers)
//!         ↓
//! EventRouter ──→ LogBridge ──→ durable log (JetStream)
//!         ↓              ↑
//! SubscriptionRegistry ←─┘ (inbound topics)
//!         ↓
//! WebSocket clients
//! ```

pub mod api;
pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod router;
pub mod subscription;
pub mod ws_server;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::ApiKeyVerifier;
pub use bridge::{JetStreamLog, LogBridge, LogConsumer, LogProducer, MemoryLog};
pub use client::{ClientId, ClientState, ConnectionManager};
pub use config::{GatewayConfig, LogBackend, LogConfig};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use protocol::{ClientMessage, ServerMessage};
pub use router::{EventRouter, SourceTable, SourceTag};
pub use subscription::SubscriptionRegistry;
pub use ws_server::{create_router, AppState};
