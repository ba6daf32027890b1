//! Projection runtime: drives envelopes through a user handler and
//! advances the durable offset.
//!
//! # Delivery modes
//!
//! - [`Projection::at_least_once`]: the handler runs first; the offset is
//!   committed after `saveOffset-afterEnvelopes` envelopes or
//!   `saveOffset-afterDuration`, whichever comes first. A crash re-delivers
//!   the uncommitted tail.
//! - [`Projection::exactly_once`]: the handler runs inside the offset
//!   store's transaction; the projected write and the offset commit
//!   together or not at all.
//! - [`Projection::grouped`]: envelopes are batched with the same
//!   thresholds; the batch handler sees the list and the offset commits
//!   after a successful return.
//!
//! Filtered placeholders never reach the handler but still advance the
//! offset.
//!
//! # Failure and restart
//!
//! A handler or storage error tears the stream down; the projection
//! restarts with backoff and reloads the offset from the store, never
//! from in-memory state, since a cancelled offset write may or may not
//! have committed. There is no poison-message auto-skip: a repeatedly
//! failing envelope blocks progress until an operator intervenes.

use crate::config::ConsumerConfig;
use crate::consumer::EventSourceProvider;
use crate::envelope::{EventEnvelope, ProjectionId, TimestampOffset};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::offset_store::OffsetStore;
use async_trait::async_trait;
use sqlx::Sqlite;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Error type handlers may return; wrapped into the engine's taxonomy.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Per-envelope handler for at-least-once delivery.
#[async_trait]
pub trait Handler: Send + 'static {
    async fn process(&mut self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Batch handler for grouped at-least-once delivery.
#[async_trait]
pub trait GroupedHandler: Send + 'static {
    async fn process_group(
        &mut self,
        envelopes: &[EventEnvelope],
    ) -> std::result::Result<(), HandlerError>;
}

/// Handler for exactly-once delivery: runs inside the offset store's
/// transaction. The side effect must live in the same transaction or be
/// idempotent.
#[async_trait]
pub trait ExactlyOnceHandler: Send + 'static {
    async fn process(
        &mut self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        envelope: &EventEnvelope,
    ) -> std::result::Result<(), HandlerError>;
}

enum DeliveryMode {
    AtLeastOnce(Box<dyn Handler>),
    ExactlyOnce(Box<dyn ExactlyOnceHandler>),
    Grouped(Box<dyn GroupedHandler>),
}

/// One consumer-side materialization with a unique [`ProjectionId`] and its
/// own offset row.
pub struct Projection {
    id: ProjectionId,
    provider: EventSourceProvider,
    offset_store: Arc<OffsetStore>,
    config: ConsumerConfig,
    mode: DeliveryMode,
}

impl Projection {
    pub fn at_least_once(
        id: ProjectionId,
        provider: EventSourceProvider,
        offset_store: Arc<OffsetStore>,
        config: ConsumerConfig,
        handler: impl Handler,
    ) -> Self {
        Self {
            id,
            provider,
            offset_store,
            config,
            mode: DeliveryMode::AtLeastOnce(Box::new(handler)),
        }
    }

    pub fn exactly_once(
        id: ProjectionId,
        provider: EventSourceProvider,
        offset_store: Arc<OffsetStore>,
        config: ConsumerConfig,
        handler: impl ExactlyOnceHandler,
    ) -> Self {
        Self {
            id,
            provider,
            offset_store,
            config,
            mode: DeliveryMode::ExactlyOnce(Box::new(handler)),
        }
    }

    pub fn grouped(
        id: ProjectionId,
        provider: EventSourceProvider,
        offset_store: Arc<OffsetStore>,
        config: ConsumerConfig,
        handler: impl GroupedHandler,
    ) -> Self {
        Self {
            id,
            provider,
            offset_store,
            config,
            mode: DeliveryMode::Grouped(Box::new(handler)),
        }
    }

    pub fn id(&self) -> &ProjectionId {
        &self.id
    }

    /// Spawn the projection. It connects, loads its offset, and resumes;
    /// on failure it restarts with backoff from the durably stored offset.
    pub fn run(self) -> ProjectionHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = self.id.clone();
        let span = tracing::info_span!("projection", projection_id = %id);
        let join = tokio::spawn(run_projection(self, stop_rx).instrument(span));
        ProjectionHandle { id, stop_tx, join }
    }
}

/// Control handle for a running projection.
///
/// Dropping the handle stops the projection; hold it for as long as the
/// projection should live.
pub struct ProjectionHandle {
    id: ProjectionId,
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ProjectionHandle {
    pub fn id(&self) -> &ProjectionId {
        &self.id
    }

    /// Graceful stop: the current in-flight envelope completes, the offset
    /// commits, the stream closes.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(projection_id = %self.id, error = %e, "Projection task panicked on stop");
        }
    }
}

async fn run_projection(projection: Projection, mut stop_rx: watch::Receiver<bool>) {
    let Projection {
        id,
        provider,
        offset_store,
        config,
        mut mode,
    } = projection;

    let backoff = config.restart_backoff.to_backoff();
    let mut restart_attempt = 0usize;

    info!("Started projection");
    loop {
        let outcome = run_stream(
            &id,
            &provider,
            &offset_store,
            &config,
            &mut mode,
            &mut stop_rx,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!("Stopped projection");
                return;
            }
            Err(e) => {
                restart_attempt += 1;
                let delay = backoff.next_delay(restart_attempt);
                metrics::record_projection_restart(&id.to_string());
                error!(
                    error = %e,
                    restart_attempt,
                    delay_ms = delay.as_millis(),
                    "Projection failed, restarting from stored offset"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut stop_rx) => {
                        info!("Stopped projection during restart backoff");
                        return;
                    }
                }
            }
        }
    }
}

/// One stream incarnation: load offset, open stream, pump envelopes until
/// stop or failure. `Ok(())` means graceful stop.
async fn run_stream(
    id: &ProjectionId,
    provider: &EventSourceProvider,
    offset_store: &OffsetStore,
    config: &ConsumerConfig,
    mode: &mut DeliveryMode,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    // Always re-ground from durable state: an interrupted save from a
    // previous incarnation may or may not have committed.
    let stored = offset_store.load(id).await?;
    let mut version = stored.as_ref().map(|s| s.version);
    let mut source = provider.source(stored.map(|s| s.offset));
    debug!(version = ?version, "Loaded offset, opening stream");

    match mode {
        DeliveryMode::AtLeastOnce(handler) => {
            let mut pending = PendingCommit::new(config);
            loop {
                tokio::select! {
                    biased;

                    _ = stopped(stop_rx) => {
                        pending.flush(id, offset_store, &mut version).await?;
                        return Ok(());
                    }

                    _ = pending.deadline_sleep(), if pending.has_deadline() => {
                        pending.flush(id, offset_store, &mut version).await?;
                    }

                    envelope = source.next() => {
                        if !envelope.filtered {
                            handler
                                .process(&envelope)
                                .await
                                .map_err(ReplicationError::Handler)?;
                            metrics::record_envelopes_processed(&id.to_string(), 1);
                        }
                        if pending.push(envelope.offset) {
                            pending.flush(id, offset_store, &mut version).await?;
                        }
                    }
                }
            }
        }

        DeliveryMode::ExactlyOnce(handler) => loop {
            tokio::select! {
                biased;

                _ = stopped(stop_rx) => return Ok(()),

                envelope = source.next() => {
                    let mut tx = offset_store.begin().await?;
                    if !envelope.filtered {
                        match handler.process(&mut tx, &envelope).await {
                            Ok(()) => {}
                            Err(e) => {
                                let _ = tx.rollback().await;
                                return Err(ReplicationError::Handler(e));
                            }
                        }
                        metrics::record_envelopes_processed(&id.to_string(), 1);
                    }
                    let new_version =
                        OffsetStore::save_in_tx(&mut tx, id, &envelope.offset, version).await?;
                    tx.commit().await.map_err(ReplicationError::from)?;
                    version = Some(new_version);
                }
            }
        },

        DeliveryMode::Grouped(handler) => {
            let mut group: Vec<EventEnvelope> = Vec::new();
            let mut pending = PendingCommit::new(config);
            loop {
                tokio::select! {
                    biased;

                    _ = stopped(stop_rx) => {
                        flush_group(handler, &mut group, id).await?;
                        pending.flush(id, offset_store, &mut version).await?;
                        return Ok(());
                    }

                    _ = pending.deadline_sleep(), if pending.has_deadline() => {
                        flush_group(handler, &mut group, id).await?;
                        pending.flush(id, offset_store, &mut version).await?;
                    }

                    envelope = source.next() => {
                        let offset = envelope.offset.clone();
                        if !envelope.filtered {
                            group.push(envelope);
                        }
                        if pending.push(offset) {
                            flush_group(handler, &mut group, id).await?;
                            pending.flush(id, offset_store, &mut version).await?;
                        }
                    }
                }
            }
        }
    }
}

async fn flush_group(
    handler: &mut Box<dyn GroupedHandler>,
    group: &mut Vec<EventEnvelope>,
    id: &ProjectionId,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }
    handler
        .process_group(group)
        .await
        .map_err(ReplicationError::Handler)?;
    metrics::record_envelopes_processed(&id.to_string(), group.len());
    group.clear();
    Ok(())
}

/// Uncommitted offset tail for the batched commit modes.
struct PendingCommit {
    offset: Option<TimestampOffset>,
    count: usize,
    since: Option<Instant>,
    after_envelopes: usize,
    after_duration: Duration,
}

impl PendingCommit {
    fn new(config: &ConsumerConfig) -> Self {
        Self {
            offset: None,
            count: 0,
            since: None,
            after_envelopes: config.save_offset_after_envelopes.max(1),
            after_duration: config.save_offset_after_duration_duration(),
        }
    }

    /// Track an envelope's offset. Returns true when the envelope
    /// threshold is reached.
    fn push(&mut self, offset: TimestampOffset) -> bool {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
        self.offset = Some(offset);
        self.count += 1;
        self.count >= self.after_envelopes
    }

    fn has_deadline(&self) -> bool {
        self.since.is_some()
    }

    async fn deadline_sleep(&self) {
        match self.since {
            Some(since) => tokio::time::sleep_until(since + self.after_duration).await,
            None => std::future::pending().await,
        }
    }

    async fn flush(
        &mut self,
        id: &ProjectionId,
        offset_store: &OffsetStore,
        version: &mut Option<i64>,
    ) -> Result<()> {
        let Some(offset) = self.offset.take() else {
            self.since = None;
            self.count = 0;
            return Ok(());
        };
        let new_version = offset_store.save(id, &offset, *version).await?;
        *version = Some(new_version);
        self.count = 0;
        self.since = None;
        debug!(version = new_version, "Committed offset");
        Ok(())
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        // A dropped handle counts as a stop signal.
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerConfig, ProducerConfig};
    use crate::envelope::{AnyPayload, SliceRange};
    use crate::journal::InMemoryJournal;
    use crate::producer::{EventProducer, EventProducerSource};
    use crate::resilience::RestartBackoff;
    use crate::transport::InProcessTransport;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingHandler {
        seen: Arc<Mutex<Vec<(String, i64)>>>,
        fail_on_seq: Option<i64>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn process(
            &mut self,
            envelope: &EventEnvelope,
        ) -> std::result::Result<(), HandlerError> {
            if Some(envelope.seq_nr) == self.fail_on_seq
                && self.failures.fetch_add(1, Ordering::SeqCst) < 2
            {
                return Err("injected handler failure".into());
            }
            self.seen
                .lock()
                .unwrap()
                .push((envelope.persistence_id.clone(), envelope.seq_nr));
            Ok(())
        }
    }

    async fn seeded_provider(events: u8) -> (Arc<InMemoryJournal>, EventSourceProvider) {
        let journal = Arc::new(InMemoryJournal::new());
        for i in 1..=events {
            journal
                .append_at(
                    "Cart",
                    "cart-1",
                    Utc.timestamp_micros(i as i64).unwrap(),
                    AnyPayload::new("type.googleapis.com/t", vec![i]),
                    vec![],
                )
                .await;
        }
        let producer = Arc::new(
            EventProducer::new(journal.clone(), ProducerConfig::for_testing())
                .with_source(EventProducerSource::new("Cart", "cart")),
        );
        let client = Arc::new(InProcessTransport::new(producer));
        let provider = EventSourceProvider::new(client, "cart", SliceRange::full())
            .with_reconnect_backoff(RestartBackoff::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
                2.0,
            ));
        (journal, provider)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_at_least_once_processes_and_commits() {
        let (_journal, provider) = seeded_provider(3).await;
        let store = Arc::new(OffsetStore::new(":memory:").await.unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = ProjectionId::new("test", "cart-0-1023");

        let handle = Projection::at_least_once(
            id.clone(),
            provider,
            store.clone(),
            ConsumerConfig::for_testing("cart"),
            CountingHandler {
                seen: seen.clone(),
                fail_on_seq: None,
                failures: Arc::new(AtomicUsize::new(0)),
            },
        )
        .run();

        let seen2 = seen.clone();
        wait_for(move || seen2.lock().unwrap().len() == 3, "3 envelopes").await;
        handle.stop().await;

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.offset.seen.get("cart-1"), Some(&3));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("cart-1".to_string(), 1),
                ("cart-1".to_string(), 2),
                ("cart-1".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_after_handler_failure_resumes_from_offset() {
        let (_journal, provider) = seeded_provider(3).await;
        let store = Arc::new(OffsetStore::new(":memory:").await.unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicUsize::new(0));
        let id = ProjectionId::new("test", "cart-0-1023");

        // Fails twice on seq 2, then succeeds.
        let handle = Projection::at_least_once(
            id.clone(),
            provider,
            store.clone(),
            ConsumerConfig::for_testing("cart"),
            CountingHandler {
                seen: seen.clone(),
                fail_on_seq: Some(2),
                failures: failures.clone(),
            },
        )
        .run();

        let seen2 = seen.clone();
        wait_for(
            move || {
                let seen = seen2.lock().unwrap();
                seen.iter().filter(|(_, s)| *s == 3).count() == 1
            },
            "seq 3 processed after restarts",
        )
        .await;
        handle.stop().await;

        assert_eq!(failures.load(Ordering::SeqCst), 2, "two injected failures");
        // Envelope 1 was committed before the failure (eager commit config),
        // so it is processed exactly once; envelope 2 succeeds on the third
        // try.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|(_, s)| *s == 1).count(), 1);
        assert_eq!(seen.iter().filter(|(_, s)| *s == 2).count(), 1);
    }

    struct TxCountingHandler {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl ExactlyOnceHandler for TxCountingHandler {
        async fn process(
            &mut self,
            _tx: &mut sqlx::Transaction<'_, Sqlite>,
            envelope: &EventEnvelope,
        ) -> std::result::Result<(), HandlerError> {
            self.seen.lock().unwrap().push(envelope.seq_nr);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exactly_once_commits_per_envelope() {
        let (_journal, provider) = seeded_provider(3).await;
        let store = Arc::new(OffsetStore::new(":memory:").await.unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = ProjectionId::new("test-eo", "cart-0-1023");

        let handle = Projection::exactly_once(
            id.clone(),
            provider,
            store.clone(),
            ConsumerConfig::for_testing("cart"),
            TxCountingHandler { seen: seen.clone() },
        )
        .run();

        let seen2 = seen.clone();
        wait_for(move || seen2.lock().unwrap().len() == 3, "3 envelopes").await;
        handle.stop().await;

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.offset.seen.get("cart-1"), Some(&3));
        assert_eq!(stored.version, 3, "one offset save per envelope");
    }

    struct BatchHandler {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl GroupedHandler for BatchHandler {
        async fn process_group(
            &mut self,
            envelopes: &[EventEnvelope],
        ) -> std::result::Result<(), HandlerError> {
            self.batches.lock().unwrap().push(envelopes.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_grouped_delivers_batches() {
        let (_journal, provider) = seeded_provider(6).await;
        let store = Arc::new(OffsetStore::new(":memory:").await.unwrap());
        let batches = Arc::new(Mutex::new(Vec::new()));
        let id = ProjectionId::new("test-grouped", "cart-0-1023");

        let mut config = ConsumerConfig::for_testing("cart");
        config.save_offset_after_envelopes = 3;

        let handle = Projection::grouped(
            id.clone(),
            provider,
            store.clone(),
            config,
            BatchHandler {
                batches: batches.clone(),
            },
        )
        .run();

        let batches2 = batches.clone();
        wait_for(
            move || batches2.lock().unwrap().iter().sum::<usize>() == 6,
            "6 envelopes in batches",
        )
        .await;
        handle.stop().await;

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.offset.seen.get("cart-1"), Some(&6));
        let batches = batches.lock().unwrap();
        assert!(batches.iter().all(|&len| len <= 3));
    }

    #[tokio::test]
    async fn test_restart_does_not_redeliver_committed() {
        let (journal, provider) = seeded_provider(3).await;
        let store = Arc::new(OffsetStore::new(":memory:").await.unwrap());
        let id = ProjectionId::new("test-resume", "cart-0-1023");

        // First incarnation processes everything and stops cleanly.
        {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let handle = Projection::at_least_once(
                id.clone(),
                provider,
                store.clone(),
                ConsumerConfig::for_testing("cart"),
                CountingHandler {
                    seen: seen.clone(),
                    fail_on_seq: None,
                    failures: Arc::new(AtomicUsize::new(0)),
                },
            )
            .run();
            let seen2 = seen.clone();
            wait_for(move || seen2.lock().unwrap().len() == 3, "3 envelopes").await;
            handle.stop().await;
        }

        // Second incarnation must re-deliver nothing until a new append.
        let producer = Arc::new(
            EventProducer::new(journal.clone(), ProducerConfig::for_testing())
                .with_source(EventProducerSource::new("Cart", "cart")),
        );
        let client = Arc::new(InProcessTransport::new(producer));
        let provider2 = EventSourceProvider::new(client, "cart", SliceRange::full())
            .with_reconnect_backoff(RestartBackoff::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
                2.0,
            ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = Projection::at_least_once(
            id.clone(),
            provider2,
            store.clone(),
            ConsumerConfig::for_testing("cart"),
            CountingHandler {
                seen: seen.clone(),
                fail_on_seq: None,
                failures: Arc::new(AtomicUsize::new(0)),
            },
        )
        .run();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty(), "no re-delivery");

        journal
            .append_at(
                "Cart",
                "cart-1",
                Utc.timestamp_micros(99).unwrap(),
                AnyPayload::new("type.googleapis.com/t", vec![4]),
                vec![],
            )
            .await;
        let seen2 = seen.clone();
        wait_for(move || seen2.lock().unwrap().len() == 1, "new envelope").await;
        handle.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec![("cart-1".to_string(), 4)]);
    }
}
