//! JetStream-backed log: topic `t` lives on subject `{prefix}.t` of one stream,
//! and the consumer group is a single durable pull consumer.

use super::transport::{LogConsumer, LogProducer, LogRecord, RecordStream};
use crate::config::LogConfig;
use crate::error::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use nats_client::{NatsClient, StreamConfig};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

pub struct JetStreamLog {
    client: NatsClient,
    stream: String,
    subject_prefix: String,
    consumer_group: String,
    active: Mutex<BTreeSet<String>>,
}

impl JetStreamLog {
    /// Connect and make sure the log stream exists.
    pub async fn connect(config: &LogConfig) -> Result<Self> {
        let client = NatsClient::connect(&config.nats_url).await?;
        client
            .ensure_stream_with_config(&Self::stream_config(config))
            .await?;

        Ok(Self {
            client,
            stream: config.stream.clone(),
            subject_prefix: config.subject_prefix.clone(),
            consumer_group: config.consumer_group.clone(),
            active: Mutex::new(BTreeSet::new()),
        })
    }

    fn stream_config(config: &LogConfig) -> StreamConfig {
        StreamConfig::for_log(&config.stream, &config.subject_prefix)
            .with_retention(config.retention.as_secs())
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    fn filter_subjects(&self, topics: &BTreeSet<String>) -> Vec<String> {
        topics.iter().map(|t| self.subject(t)).collect()
    }
}

fn topic_of(prefix: &str, subject: &str) -> String {
    subject
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(subject)
        .to_string()
}

#[async_trait]
impl LogProducer for JetStreamLog {
    async fn send(&self, topic: &str, value: Bytes) -> Result<()> {
        self.client.publish(self.subject(topic), value).await?;
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for JetStreamLog {
    async fn subscribe(&self, topics: &[String]) -> Result<RecordStream> {
        let topics: BTreeSet<String> = topics.iter().cloned().collect();
        let filters = self.filter_subjects(&topics);
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = topics;

        let consumer = self
            .client
            .durable_consumer(&self.stream, &self.consumer_group, filters.clone())
            .await?;
        let messages = consumer.messages().await.map_err(anyhow::Error::from)?;
        info!(
            "Durable consumer '{}' reading {:?}",
            self.consumer_group, filters
        );

        let prefix = self.subject_prefix.clone();
        let records = messages
            .then(move |item| {
                let prefix = prefix.clone();
                async move {
                    let message = item.map_err(anyhow::Error::from)?;
                    message
                        .ack()
                        .await
                        .map_err(|e| anyhow!("ack failed: {}", e))?;
                    counter!("gateway_log_records_consumed_total").increment(1);
                    Ok(LogRecord {
                        topic: topic_of(&prefix, &message.subject.to_string()),
                        value: message.payload.clone(),
                    })
                }
            })
            .boxed();

        Ok(records)
    }

    async fn pause(&self, topic: &str) -> Result<()> {
        let remaining = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.remove(topic);
            active.clone()
        };

        // With nothing left the bridge stops reading; the filter is rewritten
        // on the next subscribe.
        if remaining.is_empty() {
            debug!("Last topic '{}' paused", topic);
            return Ok(());
        }

        self.client
            .durable_consumer(&self.stream, &self.consumer_group, self.filter_subjects(&remaining))
            .await?;
        debug!("Topic '{}' removed from consumer filter", topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_of() {
        assert_eq!(topic_of("gateway", "gateway.events"), "events");
        assert_eq!(topic_of("gateway", "gateway.a.b"), "a.b");
        assert_eq!(topic_of("gateway", "other.events"), "other.events");
    }

    #[test]
    fn test_stream_config_uses_retention() {
        let mut config = LogConfig::default();
        config.retention = std::time::Duration::from_secs(3600);
        let stream = JetStreamLog::stream_config(&config);
        assert_eq!(stream.name, "EVENT_GATEWAY");
        assert_eq!(stream.max_age_secs, 3600);
    }
}
