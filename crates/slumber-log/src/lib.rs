//! Event log plumbing
//!
//! The event log is an at-least-once pub/sub log with keyed partitions and
//! consumer groups. [`EventPublisher`] is the write side used by the dual-write
//! protocol, [`EventLog`] adds subscriptions, and [`consumer::ConsumerLoop`]
//! drives a handler from a subscription.

pub mod consumer;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use slumber_core::event::DomainEvent;
use snafu::{Location, ResultExt as _, Snafu};

pub use self::consumer::{ConsumerLoop, EventHandler};
pub use self::memory::MemoryLog;

const LOG_TARGET: &str = "slumber::log";

/// A single message as stored in a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    #[snafu(display("Broker unavailable: {message}"))]
    BrokerUnavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Publishing timed out after {timeout:?}"))]
    PublishTimeout {
        timeout: Duration,
        #[snafu(implicit)]
        location: Location,
    },
    /// Event could not be serialized; this is a bug, never retried
    #[snafu(display("Invalid event payload"))]
    InvalidPayload {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type PublishResult<T> = std::result::Result<T, PublishError>;

impl PublishError {
    /// Transport problems; everything else is a programming error
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(
            self,
            PublishError::BrokerUnavailable { .. } | PublishError::PublishTimeout { .. }
        )
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConsumeError {
    #[snafu(display("Broker unavailable: {message}"))]
    ConsumeBrokerUnavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Record {offset} does not belong to partition {partition} of {topic}"))]
    ForeignRecord {
        topic: String,
        partition: u32,
        offset: u64,
    },
}
pub type ConsumeResult<T> = std::result::Result<T, ConsumeError>;

#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Append `payload` to `topic`, in the partition selected by `key`
    ///
    /// Returns only once the broker has accepted the message.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> PublishResult<()>;
}

#[async_trait]
pub trait EventConsumer: Send {
    /// Wait for the next record not yet delivered to this consumer
    async fn poll(&mut self) -> ConsumeResult<LogRecord>;

    /// Mark `record` (and everything before it in its partition) as processed
    async fn commit(&mut self, record: &LogRecord) -> ConsumeResult<()>;
}

#[async_trait]
pub trait EventLog: EventPublisher {
    /// Join consumer `group` on `topic`, resuming from its committed offsets
    async fn subscribe(&self, topic: &str, group: &str) -> ConsumeResult<Box<dyn EventConsumer>>;
}

pub fn encode_event(event: &DomainEvent) -> PublishResult<Vec<u8>> {
    serde_json::to_vec(event).context(InvalidPayloadSnafu)
}

pub fn decode_event(record: &LogRecord) -> Result<DomainEvent, serde_json::Error> {
    serde_json::from_slice(&record.payload)
}

/// Publish a domain event to its topic, keyed by its author
pub async fn publish_event(
    publisher: &(impl EventPublisher + ?Sized),
    event: &DomainEvent,
) -> PublishResult<()> {
    let payload = encode_event(event)?;
    publisher
        .publish(
            event.topic().as_str(),
            &event.partition_key().to_string(),
            payload,
        )
        .await
}
