//! NATS client implementation with JetStream support.

use anyhow::Result;
use async_nats::jetstream::{self, consumer, stream::Stream};
use std::time::Duration;
use tracing::{debug, info};

/// Durable pull consumer handle.
pub type PullConsumer = consumer::PullConsumer;

/// Default retention period for the gateway log (7 days).
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 10_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Ack wait for durable consumers before JetStream redelivers.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Stream capturing every topic below `subject_prefix`.
    ///
    /// Creates stream `name` with subject `{subject_prefix}.>`.
    pub fn for_log(name: &str, subject_prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            subjects: vec![format!("{}.>", subject_prefix)],
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client);

        Ok(Self { jetstream })
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream_with_config(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Create or update the durable pull consumer `durable` on `stream`,
    /// restricted to `filter_subjects`.
    ///
    /// Updating the filter keeps the consumer's stream position, which is
    /// shared by every subject. A subject removed and later re-added does not
    /// get back messages published below that position while it was out.
    pub async fn durable_consumer(
        &self,
        stream: &str,
        durable: &str,
        filter_subjects: Vec<String>,
    ) -> Result<PullConsumer> {
        debug!(
            "Configuring durable consumer '{}' on '{}' (filters: {:?})",
            durable, stream, filter_subjects
        );

        let stream = self.jetstream.get_stream(stream).await?;
        let consumer = stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(durable.to_string()),
                filter_subjects,
                deliver_policy: consumer::DeliverPolicy::All,
                ack_policy: consumer::AckPolicy::Explicit,
                ack_wait: DEFAULT_ACK_WAIT,
                ..Default::default()
            })
            .await?;

        Ok(consumer)
    }

    /// Publish a message to JetStream (with acknowledgment).
    pub async fn publish(&self, subject: impl Into<String>, payload: bytes::Bytes) -> Result<()> {
        self.jetstream
            .publish(subject.into(), payload)
            .await?
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_stream_captures_prefix() {
        let config = StreamConfig::for_log("EVENT_GATEWAY", "gateway");
        assert_eq!(config.name, "EVENT_GATEWAY");
        assert_eq!(config.subjects, vec!["gateway.>".to_string()]);
        assert_eq!(config.max_age_secs, DEFAULT_RETENTION_SECS);
    }

    #[test]
    fn test_with_retention() {
        let config = StreamConfig::for_log("LOG", "log").with_retention(60);
        assert_eq!(config.max_age_secs, 60);
        assert_eq!(config.subjects, vec!["log.>".to_string()]);
    }
}
