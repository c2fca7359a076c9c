//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing handshake token or API key.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed envelope or payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Admission rejected because the gateway is full.
    #[error("Connection limit exceeded ({max} active)")]
    CapacityExceeded { max: usize },

    /// Connection evicted after its inactivity deadline passed.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    /// Durable log connect or send failure.
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(#[from] anyhow::Error),

    /// Client not found.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Reason sent back to the client in an `error` event.
    ///
    /// Downstream failures are reported generically; the caller must resend.
    pub fn client_reason(&self) -> String {
        match self {
            GatewayError::Authentication(_) => "Invalid API key".to_string(),
            GatewayError::Validation(msg) => msg.clone(),
            GatewayError::Json(e) => format!("Malformed message: {}", e),
            GatewayError::DownstreamUnavailable(_) => "Publishing failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this error is the caller's fault rather than the gateway's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Authentication(_) | GatewayError::Validation(_) | GatewayError::Json(_)
        )
    }
}

impl From<tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
