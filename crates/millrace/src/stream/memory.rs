//! In-memory event streamer.
//!
//! Topics are append-only vectors; consumer offsets live in the shared state
//! keyed by `(topic, consumer name)`, which makes them durable across
//! consumer instances within the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::{ConsumerOptions, Event, EventConsumer, EventProducer, EventStreamer};
use crate::error::{Error, Result};
use crate::record::Header;

// Drained-topic re-check cadence; bounded below the configured poll
// frequency so tests with coarse options stay responsive.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(25);

#[derive(Default)]
struct StreamerState {
    topics: HashMap<String, Vec<Event>>,
    offsets: HashMap<(String, String), usize>,
    next_event_id: i64,
}

/// In-memory [`EventStreamer`].
#[derive(Clone, Default)]
pub struct MemoryStreamer {
    state: Arc<Mutex<StreamerState>>,
}

impl MemoryStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StreamerState> {
        self.state.lock().expect("streamer lock poisoned")
    }

    /// Number of events ever published to `topic`. Test observability.
    pub fn published_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl EventStreamer for MemoryStreamer {
    async fn new_producer(&self, topic: &str) -> Result<Box<dyn EventProducer>> {
        Ok(Box::new(MemoryProducer {
            topic: topic.to_owned(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn new_consumer(
        &self,
        topic: &str,
        name: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn EventConsumer>> {
        Ok(Box::new(MemoryConsumer {
            topic: topic.to_owned(),
            name: name.to_owned(),
            options,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryProducer {
    topic: String,
    state: Arc<Mutex<StreamerState>>,
}

#[async_trait]
impl EventProducer for MemoryProducer {
    async fn send(
        &self,
        record_id: i64,
        status: i32,
        headers: &HashMap<Header, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("streamer lock poisoned");
        state.next_event_id += 1;
        let id = state.next_event_id;
        state.topics.entry(self.topic.clone()).or_default().push(Event {
            id,
            record_id,
            status,
            headers: headers.clone(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryConsumer {
    topic: String,
    name: String,
    options: ConsumerOptions,
    state: Arc<Mutex<StreamerState>>,
}

impl MemoryConsumer {
    fn offset_key(&self) -> (String, String) {
        (self.topic.clone(), self.name.clone())
    }

    fn peek(&self) -> Option<Event> {
        let state = self.state.lock().expect("streamer lock poisoned");
        let offset = state.offsets.get(&self.offset_key()).copied().unwrap_or(0);
        let event = state.topics.get(&self.topic)?.get(offset)?;

        if !self.options.lag.is_zero()
            && event.created_at + self.options.lag > OffsetDateTime::now_utc()
        {
            return None;
        }
        Some(event.clone())
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn recv(&mut self, ctx: &CancellationToken) -> Result<Event> {
        let idle = self.options.poll_frequency.min(MAX_IDLE_SLEEP);
        loop {
            if let Some(event) = self.peek() {
                return Ok(event);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(idle) => {}
            }
        }
    }

    async fn ack(&mut self, event: &Event) -> Result<()> {
        let key = self.offset_key();
        let mut state = self.state.lock().expect("streamer lock poisoned");
        let offset = state.offsets.get(&key).copied().unwrap_or(0);

        let at_offset = state
            .topics
            .get(&self.topic)
            .and_then(|events| events.get(offset))
            .map(|current| current.id == event.id)
            .unwrap_or(false);
        if at_offset {
            state.offsets.insert(key, offset + 1);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
