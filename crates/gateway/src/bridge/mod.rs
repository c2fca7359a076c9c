//! Bridge between the gateway and the durable log.
//!
//! The producer side is a thin wrapper that serializes and appends. The
//! consumer side multiplexes one consumer group over many logical
//! subscribers: each topic is physically consumed while at least one
//! subscriber is registered for it, and a record on a topic is handed to
//! every subscriber of that topic.
//!
//! The log client cannot extend a running subscription, so adding a topic
//! stops the consumption loop, resubscribes with the full topic set and
//! starts a new loop. Removing the last subscriber of a topic pauses that
//! topic. All topic transitions are serialized behind one async lock.

mod jetstream;
mod memory;
mod transport;

pub use jetstream::JetStreamLog;
pub use memory::MemoryLog;
pub use transport::{
    InboundRecord, LogConsumer, LogProducer, LogRecord, RecordCallback, RecordStream,
};

use crate::error::Result;
use dashmap::DashMap;
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// topic -> subscriber id -> callback
type TopicMap = DashMap<String, HashMap<String, RecordCallback>>;

pub struct LogBridge {
    producer: Arc<dyn LogProducer>,
    consumer: Arc<dyn LogConsumer>,
    topics: Arc<TopicMap>,
    /// Running consumption loop, if any.
    session: Mutex<Option<JoinHandle<()>>>,
}

impl LogBridge {
    pub fn new(producer: Arc<dyn LogProducer>, consumer: Arc<dyn LogConsumer>) -> Self {
        Self {
            producer,
            consumer,
            topics: Arc::new(DashMap::new()),
            session: Mutex::new(None),
        }
    }

    /// Serialize `message` and append it to `topic`.
    pub async fn publish<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let value = serde_json::to_vec(message)?;
        match self.producer.send(topic, value.into()).await {
            Ok(()) => {
                counter!("gateway_log_writes_total", "result" => "ok").increment(1);
                debug!("Message written to topic {}", topic);
                Ok(())
            }
            Err(e) => {
                counter!("gateway_log_writes_total", "result" => "error").increment(1);
                error!("Failed to write to topic {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Register `callback` for records on `topic` under `subscriber_id`.
    ///
    /// The first subscriber of a topic restarts consumption with the topic
    /// added. A repeated (subscriber, topic) pair is a no-op.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        topic: &str,
        callback: RecordCallback,
    ) -> Result<()> {
        let mut session = self.session.lock().await;

        let is_new = !self.topics.contains_key(topic);
        {
            let mut subscribers = self.topics.entry(topic.to_string()).or_default();
            if subscribers.contains_key(subscriber_id) {
                warn!(
                    "Subscriber {} is already subscribed to topic {}",
                    subscriber_id, topic
                );
                return Ok(());
            }
            subscribers.insert(subscriber_id.to_string(), callback);
        }

        if is_new {
            if let Err(e) = self.restart(&mut session).await {
                error!("Failed to start consuming topic {}: {}", topic, e);
                self.topics.remove(topic);
                if !self.topics.is_empty() {
                    if let Err(e) = self.restart(&mut session).await {
                        error!("Failed to resume consumption after rollback: {}", e);
                    }
                }
                self.record_gauge();
                return Err(e);
            }
            info!("Started listening to new topic: {}", topic);
        }

        self.record_gauge();
        info!("Subscriber {} subscribed to topic {}", subscriber_id, topic);
        Ok(())
    }

    /// Drop `subscriber_id` from `topic`. Returns whether it was registered.
    pub async fn unsubscribe(&self, subscriber_id: &str, topic: &str) -> bool {
        let mut session = self.session.lock().await;
        let removed = self.detach(&mut session, subscriber_id, topic).await;
        self.record_gauge();
        removed
    }

    /// Drop `subscriber_id` from every topic it is registered on.
    pub async fn unsubscribe_all(&self, subscriber_id: &str) {
        let mut session = self.session.lock().await;
        let topics: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().contains_key(subscriber_id))
            .map(|entry| entry.key().clone())
            .collect();

        for topic in topics {
            self.detach(&mut session, subscriber_id, &topic).await;
        }
        self.record_gauge();
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.topics
            .iter()
            .any(|entry| entry.value().contains_key(subscriber_id))
    }

    /// Whether `topic` is currently being consumed.
    pub fn is_active(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Stop the consumption loop. Registered subscribers are kept.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.session.lock().await.take() {
            handle.abort();
            info!("Log consumption stopped");
        }
    }

    async fn detach(
        &self,
        session: &mut Option<JoinHandle<()>>,
        subscriber_id: &str,
        topic: &str,
    ) -> bool {
        let (removed, now_empty) = match self.topics.get_mut(topic) {
            Some(mut subscribers) => {
                let removed = subscribers.remove(subscriber_id).is_some();
                (removed, subscribers.is_empty())
            }
            None => (false, false),
        };

        if !removed {
            warn!(
                "No subscription for subscriber {} on topic {}",
                subscriber_id, topic
            );
            return false;
        }
        info!("Subscriber {} unsubscribed from topic {}", subscriber_id, topic);

        if now_empty {
            self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
            match self.consumer.pause(topic).await {
                Ok(()) => info!("Paused topic {}", topic),
                Err(e) => error!("Failed to pause topic {}: {}", topic, e),
            }
            if self.topics.is_empty() {
                if let Some(handle) = session.take() {
                    handle.abort();
                    info!("No active topics; log consumption stopped");
                }
            }
        }
        true
    }

    /// Stop the loop, resubscribe with the full topic set and start a new loop.
    async fn restart(&self, session: &mut Option<JoinHandle<()>>) -> Result<()> {
        if let Some(handle) = session.take() {
            handle.abort();
        }

        let topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        let records = self.consumer.subscribe(&topics).await?;
        *session = Some(tokio::spawn(consume(records, self.topics.clone())));
        debug!("Log consumption running for {:?}", topics);
        Ok(())
    }

    fn record_gauge(&self) {
        gauge!("gateway_log_active_topics").set(self.topics.len() as f64);
    }
}

async fn consume(mut records: RecordStream, topics: Arc<TopicMap>) {
    while let Some(item) = records.next().await {
        match item {
            Ok(record) => dispatch(&topics, record),
            Err(e) => {
                counter!("gateway_log_consume_errors_total").increment(1);
                warn!("Log consumer error: {}", e);
            }
        }
    }
    debug!("Log record stream ended");
}

fn dispatch(topics: &TopicMap, record: LogRecord) {
    // Clone the callbacks out so no map guard is held while they run.
    let callbacks: Vec<RecordCallback> = match topics.get(&record.topic) {
        Some(subscribers) => subscribers.values().cloned().collect(),
        None => {
            debug!("Dropping record for inactive topic {}", record.topic);
            return;
        }
    };

    if record.value.is_empty() {
        warn!("Empty record on topic {}", record.topic);
        return;
    }

    let inbound = InboundRecord::parse(&record.value);
    for callback in callbacks {
        callback(&record.topic, &inbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogMessage;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    type Seen = mpsc::UnboundedReceiver<(String, String, InboundRecord)>;

    fn recorder(name: &str) -> (RecordCallback, Seen) {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = name.to_string();
        let callback: RecordCallback = Arc::new(move |topic: &str, record: &InboundRecord| {
            let _ = tx.send((name.clone(), topic.to_string(), record.clone()));
        });
        (callback, rx)
    }

    async fn next(seen: &mut Seen) -> (String, String, InboundRecord) {
        timeout(Duration::from_secs(1), seen.recv())
            .await
            .expect("record delivered")
            .expect("channel open")
    }

    async fn nothing(seen: &mut Seen) {
        assert!(timeout(Duration::from_millis(100), seen.recv()).await.is_err());
    }

    fn bridge() -> (LogBridge, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        (LogBridge::new(log.clone(), log.clone()), log)
    }

    #[tokio::test]
    async fn test_publish_writes_serialized_message() {
        let (bridge, log) = bridge();
        let id = Uuid::new_v4();
        bridge
            .publish("events", &LogMessage { payload: json!({ "a": 1 }), tracking_id: id })
            .await
            .unwrap();

        let records = log.records("events");
        assert_eq!(records.len(), 1);
        let value: Value = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(value, json!({ "payload": { "a": 1 }, "trackingId": id.to_string() }));
    }

    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let bridge = LogBridge::new(
            Arc::new(crate::testing::UnavailableProducer),
            Arc::new(MemoryLog::new()),
        );
        let err = bridge.publish("events", &json!({})).await.unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::DownstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_records_reach_every_subscriber_of_topic() {
        let (bridge, log) = bridge();
        let (cb_a, mut seen_a) = recorder("a");
        let (cb_b, mut seen_b) = recorder("b");
        let (cb_c, mut seen_c) = recorder("c");
        bridge.subscribe("a", "orders", cb_a).await.unwrap();
        bridge.subscribe("b", "orders", cb_b).await.unwrap();
        bridge.subscribe("c", "billing", cb_c).await.unwrap();

        let id = Uuid::new_v4();
        bridge
            .publish("orders", &LogMessage { payload: json!({ "n": 1 }), tracking_id: id })
            .await
            .unwrap();

        for seen in [&mut seen_a, &mut seen_b] {
            let (_, topic, record) = next(seen).await;
            assert_eq!(topic, "orders");
            assert!(matches!(record, InboundRecord::Message(m) if m.tracking_id == id));
        }
        nothing(&mut seen_c).await;
        // One physical subscription per new topic, none for the second subscriber.
        assert_eq!(log.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_raw_record_delivered_as_text() {
        let (bridge, log) = bridge();
        let (cb, mut seen) = recorder("a");
        bridge.subscribe("a", "raw", cb).await.unwrap();

        log.send("raw", bytes::Bytes::from_static(b"plain text")).await.unwrap();
        let (_, _, record) = next(&mut seen).await;
        assert_eq!(record, InboundRecord::Raw("plain text".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_subscription_is_noop() {
        let (bridge, log) = bridge();
        let (cb, mut seen) = recorder("a");
        bridge.subscribe("a", "t", cb.clone()).await.unwrap();
        bridge.subscribe("a", "t", cb).await.unwrap();
        assert_eq!(bridge.subscriber_count("t"), 1);
        assert_eq!(log.subscribe_calls(), 1);

        bridge.publish("t", &json!("x")).await.unwrap();
        next(&mut seen).await;
        nothing(&mut seen).await;
    }

    #[tokio::test]
    async fn test_topic_stays_active_until_last_subscriber_leaves() {
        let (bridge, log) = bridge();
        let (cb_a, _seen_a) = recorder("a");
        let (cb_b, mut seen_b) = recorder("b");
        bridge.subscribe("a", "t", cb_a).await.unwrap();
        bridge.subscribe("b", "t", cb_b).await.unwrap();

        assert!(bridge.unsubscribe("a", "t").await);
        assert!(bridge.is_active("t"));
        bridge.publish("t", &json!("still here")).await.unwrap();
        next(&mut seen_b).await;

        assert!(bridge.unsubscribe("b", "t").await);
        assert!(!bridge.is_active("t"));
        assert_eq!(bridge.topic_count(), 0);
        assert!(log.active_topics().is_empty());

        assert!(!bridge.unsubscribe("b", "t").await);
    }

    #[tokio::test]
    async fn test_resubscribe_resumes_from_committed_position() {
        let (bridge, log) = bridge();
        let (cb, mut seen) = recorder("a");
        bridge.subscribe("a", "t", cb.clone()).await.unwrap();
        bridge.publish("t", &json!(1)).await.unwrap();
        next(&mut seen).await;

        bridge.unsubscribe("a", "t").await;
        bridge.publish("t", &json!(2)).await.unwrap();
        nothing(&mut seen).await;

        bridge.subscribe("a", "t", cb).await.unwrap();
        let (_, _, record) = next(&mut seen).await;
        assert_eq!(record, InboundRecord::Json(json!(2)));
        nothing(&mut seen).await;
        assert_eq!(log.subscribe_calls(), 2);
    }

    /// Consumer that takes a while to subscribe and remembers every call.
    #[derive(Default)]
    struct SlowConsumer {
        in_flight: std::sync::atomic::AtomicUsize,
        overlapped: std::sync::atomic::AtomicBool,
        calls: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl LogConsumer for SlowConsumer {
        async fn subscribe(&self, topics: &[String]) -> Result<RecordStream> {
            use std::sync::atomic::Ordering;
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut sorted = topics.to_vec();
            sorted.sort();
            self.calls.lock().unwrap().push(sorted);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(futures::stream::pending().boxed())
        }

        async fn pause(&self, _topic: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_subscribers_are_serialized() {
        let consumer = Arc::new(SlowConsumer::default());
        let bridge = LogBridge::new(Arc::new(MemoryLog::new()), consumer.clone());
        let (cb_a, _seen_a) = recorder("a");
        let (cb_b, _seen_b) = recorder("b");

        let (a, b) = tokio::join!(
            bridge.subscribe("a", "orders", cb_a),
            bridge.subscribe("b", "billing", cb_b),
        );
        a.unwrap();
        b.unwrap();

        assert!(!consumer.overlapped.load(std::sync::atomic::Ordering::SeqCst));
        let calls = consumer.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(
            calls.last().unwrap(),
            &vec!["billing".to_string(), "orders".to_string()]
        );
        assert_eq!(bridge.topic_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let (bridge, _log) = bridge();
        let (cb, _seen) = recorder("a");
        let (other, _other_seen) = recorder("b");
        bridge.subscribe("a", "x", cb.clone()).await.unwrap();
        bridge.subscribe("a", "y", cb).await.unwrap();
        bridge.subscribe("b", "y", other).await.unwrap();
        assert!(bridge.has_subscriber("a"));

        bridge.unsubscribe_all("a").await;
        assert!(!bridge.has_subscriber("a"));
        assert!(!bridge.is_active("x"));
        assert!(bridge.is_active("y"));
    }
}
