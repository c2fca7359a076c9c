//! JetStream client used by the event gateway as its durable log.
//!
//! Topics are mapped onto subjects below a single stream; consumption goes
//! through one durable pull consumer whose filter subjects are the active
//! topic set.

pub mod client;

pub use client::{
    NatsClient, PullConsumer, StreamConfig, DEFAULT_MAX_BYTES, DEFAULT_MAX_MESSAGES,
    DEFAULT_RETENTION_SECS,
};
