//! End-to-end harness: in-memory journal behind a producer, reached through
//! the in-process transport, with a recording handler on the consumer side.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_replication::config::{ConsumerConfig, ProducerConfig};
use event_replication::consumer::EventSourceProvider;
use event_replication::envelope::{AnyPayload, EventEnvelope, SliceRange};
use event_replication::filter::ConsumerFilterRegistry;
use event_replication::journal::InMemoryJournal;
use event_replication::producer::{EventProducer, EventProducerSource};
use event_replication::projection::{Handler, HandlerError};
use event_replication::resilience::RestartBackoff;
use event_replication::transport::InProcessTransport;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ENTITY_TYPE: &str = "ShoppingCart";
pub const STREAM_ID: &str = "cart";

pub fn ts(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).unwrap()
}

pub fn payload(n: u8) -> AnyPayload {
    AnyPayload::new("type.googleapis.com/shop.Event", vec![n])
}

/// Append `(pid, seq implied, timestamp, tags)` fixtures to a journal.
pub async fn seed(journal: &InMemoryJournal, events: &[(&str, i64, &[&str])]) {
    for (pid, micros, tags) in events {
        journal
            .append_at(
                ENTITY_TYPE,
                pid,
                ts(*micros),
                payload(*micros as u8),
                tags.iter().map(|t| t.to_string()).collect(),
            )
            .await;
    }
}

/// Tight backoff so failure paths stay fast in tests.
pub fn fast_backoff() -> RestartBackoff {
    RestartBackoff::new(Duration::from_millis(1), Duration::from_millis(20), 2.0)
}

/// A full producer stack over the given journal.
pub struct TestProducer {
    pub journal: Arc<InMemoryJournal>,
    pub client: Arc<InProcessTransport>,
}

impl TestProducer {
    pub fn new(journal: Arc<InMemoryJournal>) -> Self {
        Self::with_source(journal, EventProducerSource::new(ENTITY_TYPE, STREAM_ID))
    }

    pub fn with_source(journal: Arc<InMemoryJournal>, source: EventProducerSource) -> Self {
        let producer = Arc::new(
            EventProducer::new(journal.clone(), ProducerConfig::for_testing()).with_source(source),
        );
        Self {
            journal,
            client: Arc::new(InProcessTransport::new(producer)),
        }
    }

    /// Provider for one slice range, optionally wired to a filter registry.
    pub fn provider(
        &self,
        range: SliceRange,
        registry: Option<Arc<ConsumerFilterRegistry>>,
    ) -> EventSourceProvider {
        let mut provider =
            EventSourceProvider::new(self.client.clone(), STREAM_ID, range)
                .with_reconnect_backoff(fast_backoff());
        if let Some(registry) = registry {
            provider = provider.with_filter_registry(registry);
        }
        provider
    }
}

pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig::for_testing(STREAM_ID)
}

/// Handler that records every envelope it sees.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<(String, i64)>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<(String, i64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn process(&mut self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push((envelope.persistence_id.clone(), envelope.seq_nr));
        Ok(())
    }
}

/// Poll until `condition` holds or a generous timeout expires.
pub async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
