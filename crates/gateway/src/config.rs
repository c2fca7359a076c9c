//! Gateway configuration, read from the environment.

use crate::error::{GatewayError, Result};
use crate::router::SourceTable;
use std::str::FromStr;
use std::time::Duration;

/// Which durable log implementation backs the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    /// NATS JetStream.
    Nats,
    /// Process-local log, for local runs without a broker.
    Memory,
}

impl FromStr for LogBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" | "jetstream" => Ok(LogBackend::Nats),
            "memory" => Ok(LogBackend::Memory),
            other => Err(GatewayError::Config(format!("unknown LOG_BACKEND '{}'", other))),
        }
    }
}

/// Durable log settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub backend: LogBackend,
    pub nats_url: String,
    /// JetStream stream holding every topic.
    pub stream: String,
    /// Subject prefix; topic `t` lives on `{subject_prefix}.t`.
    pub subject_prefix: String,
    /// Topic receiving Durable-classified publishes.
    pub durable_topic: String,
    /// Topics the gateway consumes and fans out to event subscribers.
    pub inbound_topics: Vec<String>,
    /// Durable consumer name (consumer group).
    pub consumer_group: String,
    /// How long the log keeps records.
    pub retention: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::Nats,
            nats_url: "nats://localhost:4222".to_string(),
            stream: "EVENT_GATEWAY".to_string(),
            subject_prefix: "gateway".to_string(),
            durable_topic: "events".to_string(),
            inbound_topics: vec!["notifications".to_string()],
            consumer_group: "event-gateway".to_string(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    /// Shared secret expected as `Authorization: Bearer <token>` on the handshake.
    pub handshake_token: String,
    /// Credential allowed to publish (and subscribe).
    pub publish_key: String,
    /// Credential allowed to subscribe only.
    pub subscribe_key: String,
    pub max_connections: usize,
    pub inactivity_timeout: Duration,
    pub sources: SourceTable,
    pub log: LogConfig,
}

impl GatewayConfig {
    /// Configuration with default limits around the three credentials.
    pub fn new(
        handshake_token: impl Into<String>,
        publish_key: impl Into<String>,
        subscribe_key: impl Into<String>,
    ) -> Self {
        Self {
            http_port: 8080,
            metrics_port: 9094,
            handshake_token: handshake_token.into(),
            publish_key: publish_key.into(),
            subscribe_key: subscribe_key.into(),
            max_connections: 1000,
            inactivity_timeout: Duration::from_millis(300_000),
            sources: SourceTable::default(),
            log: LogConfig::default(),
        }
    }

    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GatewayError::Config(format!("{} must be set", key)))
        };

        let mut config = Self::new(
            required("WEBSOCKET_API_KEY")?,
            required("WEBSOCKET_EVENT_PUBSUB_KEY")?,
            required("WEBSOCKET_EVENT_SUBSCRIPTION_KEY")?,
        );

        if let Some(v) = lookup("HTTP_PORT") {
            config.http_port = parse_number("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("METRICS_PORT") {
            config.metrics_port = parse_number("METRICS_PORT", &v)?;
        }
        if let Some(v) = lookup("CLIENT_MAX_CONNECTIONS") {
            config.max_connections = parse_number("CLIENT_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("CLIENT_INACTIVITY_TIMEOUT_MS") {
            let ms: u64 = parse_number("CLIENT_INACTIVITY_TIMEOUT_MS", &v)?;
            if ms == 0 {
                return Err(GatewayError::Config(
                    "CLIENT_INACTIVITY_TIMEOUT_MS must be positive".to_string(),
                ));
            }
            config.inactivity_timeout = Duration::from_millis(ms);
        }

        let durable = lookup("SOURCE_DURABLE")
            .map(|v| parse_list("SOURCE_DURABLE", &v))
            .transpose()?;
        let relay = lookup("SOURCE_DIRECT_RELAY")
            .map(|v| parse_list("SOURCE_DIRECT_RELAY", &v))
            .transpose()?;
        let default = lookup("SOURCE_DEFAULT")
            .map(|v| parse_list("SOURCE_DEFAULT", &v))
            .transpose()?;
        if durable.is_some() || relay.is_some() || default.is_some() {
            let base = SourceTable::default();
            config.sources = SourceTable::new(
                durable.unwrap_or_else(|| base.numbers(crate::router::SourceTag::Durable)),
                relay.unwrap_or_else(|| base.numbers(crate::router::SourceTag::DirectRelay)),
                default.unwrap_or_else(|| base.numbers(crate::router::SourceTag::Default)),
            )?;
        }

        if let Some(v) = lookup("LOG_BACKEND") {
            config.log.backend = v.parse()?;
        }
        if let Some(v) = lookup("NATS_URL") {
            config.log.nats_url = v;
        }
        if let Some(v) = lookup("LOG_STREAM") {
            config.log.stream = v;
        }
        if let Some(v) = lookup("LOG_SUBJECT_PREFIX") {
            config.log.subject_prefix = v;
        }
        if let Some(v) = lookup("DURABLE_TOPIC") {
            config.log.durable_topic = v;
        }
        if let Some(v) = lookup("INBOUND_TOPICS") {
            config.log.inbound_topics = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("CONSUMER_GROUP") {
            config.log.consumer_group = v;
        }
        if let Some(v) = lookup("LOG_RETENTION_SECS") {
            config.log.retention = Duration::from_secs(parse_number("LOG_RETENTION_SECS", &v)?);
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} must be a number, got '{}'", key, value)))
}

fn parse_list(key: &str, value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(key, s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::SourceTag;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRETS: [(&str, &str); 3] = [
        ("WEBSOCKET_API_KEY", "handshake"),
        ("WEBSOCKET_EVENT_PUBSUB_KEY", "pub"),
        ("WEBSOCKET_EVENT_SUBSCRIPTION_KEY", "sub"),
    ];

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&SECRETS)).unwrap();
        assert_eq!(config.handshake_token, "handshake");
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.inactivity_timeout, Duration::from_millis(300_000));
        assert_eq!(config.log.backend, LogBackend::Nats);
        assert_eq!(config.log.inbound_topics, vec!["notifications".to_string()]);
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        let err = GatewayConfig::from_lookup(lookup(&SECRETS[..2])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("WEBSOCKET_EVENT_SUBSCRIPTION_KEY")));
    }

    #[test]
    fn test_overrides() {
        let mut vars = SECRETS.to_vec();
        vars.extend([
            ("CLIENT_MAX_CONNECTIONS", "5"),
            ("CLIENT_INACTIVITY_TIMEOUT_MS", "1500"),
            ("LOG_BACKEND", "memory"),
            ("INBOUND_TOPICS", "alerts, audit,"),
            ("SOURCE_DIRECT_RELAY", "3,7"),
            ("LOG_RETENTION_SECS", "86400"),
        ]);
        let config = GatewayConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.inactivity_timeout, Duration::from_millis(1500));
        assert_eq!(config.log.backend, LogBackend::Memory);
        assert_eq!(config.log.inbound_topics, vec!["alerts".to_string(), "audit".to_string()]);
        assert_eq!(config.sources.classify(7).unwrap(), SourceTag::DirectRelay);
        assert_eq!(config.sources.classify(1).unwrap(), SourceTag::Durable);
        assert_eq!(config.log.retention, Duration::from_secs(86_400));
    }

    #[test]
    fn test_bad_number() {
        let mut vars = SECRETS.to_vec();
        vars.push(("HTTP_PORT", "eighty"));
        assert!(GatewayConfig::from_lookup(lookup(&vars)).is_err());
    }
}
