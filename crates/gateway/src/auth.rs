//! API-key and handshake token checks.

use crate::error::{GatewayError, Result};

/// Stateless verifier for the static gateway credentials.
#[derive(Debug, Clone)]
pub struct ApiKeyVerifier {
    handshake_token: String,
    publish_key: String,
    subscribe_key: String,
}

impl ApiKeyVerifier {
    pub fn new(
        handshake_token: impl Into<String>,
        publish_key: impl Into<String>,
        subscribe_key: impl Into<String>,
    ) -> Self {
        Self {
            handshake_token: handshake_token.into(),
            publish_key: publish_key.into(),
            subscribe_key: subscribe_key.into(),
        }
    }

    /// Only the publish credential may publish.
    pub fn verify_publish(&self, api_key: &str) -> Result<()> {
        if secure_eq(api_key, &self.publish_key) {
            Ok(())
        } else {
            Err(GatewayError::Authentication(
                "Invalid API key for publishing events".to_string(),
            ))
        }
    }

    /// Either credential may subscribe.
    pub fn verify_subscribe(&self, api_key: &str) -> Result<()> {
        // Evaluate both so timing does not reveal which key matched.
        let publish = secure_eq(api_key, &self.publish_key);
        let subscribe = secure_eq(api_key, &self.subscribe_key);
        if publish | subscribe {
            Ok(())
        } else {
            Err(GatewayError::Authentication(
                "Invalid API key for subscribing to events".to_string(),
            ))
        }
    }

    /// Check an `Authorization` header value of the form `Bearer <token>`.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<()> {
        let header = header.ok_or_else(|| {
            GatewayError::Authentication("Authorization token is missing".to_string())
        })?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| GatewayError::Authentication("Invalid token format".to_string()))?;

        if secure_eq(token.trim(), &self.handshake_token) {
            Ok(())
        } else {
            Err(GatewayError::Authentication("Unauthorized".to_string()))
        }
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn secure_eq(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() || b.is_empty() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
