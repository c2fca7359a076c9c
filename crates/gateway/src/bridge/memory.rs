//! Process-local log with consumer-group offsets.
//!
//! Used for `LOG_BACKEND=memory` and in tests. Offsets are committed only
//! when the consumption loop actually reads a record, so a record queued on a
//! stream that is torn down, or on a topic that was paused, is replayed by the
//! next subscription.

use super::transport::{LogConsumer, LogProducer, LogRecord, RecordStream};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

type Delivery = (String, usize, Bytes);

struct Session {
    generation: u64,
    active: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Bytes>>,
    /// Next offset the group will read, per topic.
    committed: HashMap<String, usize>,
    session: Option<Session>,
    generation: u64,
    subscribe_calls: usize,
}

#[derive(Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        lock_state(&self.state)
    }

    /// Everything written to `topic`, in order.
    pub fn records(&self, topic: &str) -> Vec<Bytes> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// How many times the group subscribed.
    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Topics currently delivering records.
    pub fn active_topics(&self) -> Vec<String> {
        let state = self.lock();
        let mut topics: Vec<String> = state
            .session
            .as_ref()
            .map(|s| s.active.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}

fn lock_state(state: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LogProducer for MemoryLog {
    async fn send(&self, topic: &str, value: Bytes) -> Result<()> {
        let mut state = self.lock();
        let log = state.topics.entry(topic.to_string()).or_default();
        log.push(value.clone());
        let offset = log.len() - 1;

        if let Some(session) = &state.session {
            if session.active.contains(topic) {
                let _ = session.tx.send((topic.to_string(), offset, value));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for MemoryLog {
    async fn subscribe(&self, topics: &[String]) -> Result<RecordStream> {
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let generation = {
            let mut state = self.lock();
            state.subscribe_calls += 1;
            state.generation += 1;
            let generation = state.generation;

            for topic in topics {
                let from = state.committed.get(topic).copied().unwrap_or(0);
                if let Some(log) = state.topics.get(topic) {
                    for (offset, value) in log.iter().enumerate().skip(from) {
                        let _ = tx.send((topic.clone(), offset, value.clone()));
                    }
                }
            }

            // Replacing the session drops the previous sender and ends its stream.
            state.session = Some(Session {
                generation,
                active: topics.iter().cloned().collect(),
                tx,
            });
            generation
        };
        debug!("Memory log subscribed to {:?} (generation {})", topics, generation);

        let state = self.state.clone();
        let records = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .filter_map(move |(topic, offset, value)| {
            let mut state = lock_state(&state);
            let live = state
                .session
                .as_ref()
                .is_some_and(|s| s.generation == generation && s.active.contains(&topic));
            let record = if live {
                let next = state.committed.entry(topic.clone()).or_insert(0);
                *next = (*next).max(offset + 1);
                Some(Ok(LogRecord { topic, value }))
            } else {
                None
            };
            future::ready(record)
        })
        .boxed();

        Ok(records)
    }

    async fn pause(&self, topic: &str) -> Result<()> {
        if let Some(session) = self.lock().session.as_mut() {
            session.active.remove(topic);
        }
        Ok(())
    }
}
