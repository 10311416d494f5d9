//! Event streaming abstraction.
//!
//! Every record mutation publishes an event on the topic for the record's
//! `(workflow, status)` pair. Consumers are identified by name and the
//! streamer must persist their offsets keyed by that name, so a restarted
//! consumer resumes where its predecessor acknowledged.

mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryStreamer;

use crate::error::Result;
use crate::record::Header;

/// A delivered stream event.
///
/// `id` is the consumer-visible offset; `record_id` is the sequence
/// identifier the record store assigned to the write that produced the
/// event (the event key).
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub record_id: i64,
    pub status: i32,
    pub headers: HashMap<Header, String>,
    pub created_at: OffsetDateTime,
}

impl Event {
    /// The run identifier header, when present.
    pub fn run_id(&self) -> Option<&str> {
        self.headers.get(&Header::RunId).map(String::as_str)
    }
}

/// Options applied when creating a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How often to poll when the topic is drained.
    pub poll_frequency: Duration,
    /// Hold events back until they are at least this old.
    pub lag: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_frequency: Duration::from_millis(500),
            lag: Duration::ZERO,
        }
    }
}

/// Factory for producers and named durable consumers.
#[async_trait]
pub trait EventStreamer: Send + Sync {
    async fn new_producer(&self, topic: &str) -> Result<Box<dyn EventProducer>>;

    async fn new_consumer(
        &self,
        topic: &str,
        name: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn EventConsumer>>;
}

/// Publishes events onto a single topic.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Publish an event keyed by the record store sequence identifier.
    async fn send(&self, record_id: i64, status: i32, headers: &HashMap<Header, String>)
        -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A durable, named consumer of a single topic.
///
/// `recv` blocks until an event is available or `ctx` is cancelled
/// (returning [`Error::Cancelled`]); `ack` commits the consumer offset past
/// the event. An event that is never acknowledged is redelivered to the next
/// consumer with the same name.
///
/// [`Error::Cancelled`]: crate::Error::Cancelled
#[async_trait]
pub trait EventConsumer: Send {
    async fn recv(&mut self, ctx: &CancellationToken) -> Result<Event>;

    async fn ack(&mut self, event: &Event) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
