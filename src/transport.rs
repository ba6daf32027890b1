//! Transport seam for the replication protocol.
//!
//! The engine is transport-agnostic: streams are pairs of bounded channels
//! carrying protobuf-encoded frames, and the consumer reaches the producer
//! through [`ReplicationClient`]. An HTTP/2 binding plugs a real network
//! client into this trait; [`InProcessTransport`] wires directly to a local
//! [`EventProducer`] and is what tests and single-process deployments use.
//!
//! Channel capacity doubles as the backpressure bound: the producer cannot
//! run more than one page of envelopes ahead of consumer demand, because
//! `send` on a full channel suspends the stream task.

use crate::error::{ReplicationError, Result};
use crate::producer::EventProducer;
use crate::proto;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One protobuf-encoded protocol message.
pub type Frame = Bytes;

/// Client view of the producer: open replication streams and perform the
/// unary lookups.
#[async_trait]
pub trait ReplicationClient: Send + Sync + 'static {
    /// Open a bidirectional stream.
    ///
    /// Returns the sender for `StreamIn` frames and the receiver of
    /// `StreamOut` frames. Either side closing its channel closes the
    /// stream.
    async fn open_stream(&self) -> Result<(mpsc::Sender<Frame>, mpsc::Receiver<Frame>)>;

    /// Journal timestamp of a specific event.
    async fn event_timestamp(
        &self,
        request: proto::EventTimestampRequest,
    ) -> Result<proto::EventTimestampResponse>;

    /// Load a specific event without re-scanning slices.
    async fn load_event(&self, request: proto::LoadEventRequest) -> Result<proto::LoadEventResponse>;
}

/// Direct, in-process binding of consumer to producer.
pub struct InProcessTransport {
    producer: Arc<EventProducer>,
    buffer: usize,
}

impl InProcessTransport {
    pub fn new(producer: Arc<EventProducer>) -> Self {
        let buffer = producer.page_size().max(1);
        Self { producer, buffer }
    }
}

#[async_trait]
impl ReplicationClient for InProcessTransport {
    async fn open_stream(&self) -> Result<(mpsc::Sender<Frame>, mpsc::Receiver<Frame>)> {
        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        let (out_tx, out_rx) = mpsc::channel(self.buffer);

        let producer = Arc::clone(&self.producer);
        tokio::spawn(async move {
            if let Err(e) = producer.handle_stream(in_rx, out_tx).await {
                // The stream task owns the error; the consumer observes the
                // closed channel and reconnects from its stored offset.
                debug!(error = %e, "Replication stream ended with error");
            }
        });

        Ok((in_tx, out_rx))
    }

    async fn event_timestamp(
        &self,
        request: proto::EventTimestampRequest,
    ) -> Result<proto::EventTimestampResponse> {
        self.producer.event_timestamp(request).await
    }

    async fn load_event(&self, request: proto::LoadEventRequest) -> Result<proto::LoadEventResponse> {
        self.producer.load_event(request).await
    }
}

/// A client wrapper that fails `open_stream` a configurable number of times
/// before delegating. Exercises reconnect paths in tests.
pub struct FlakyTransport<C> {
    inner: C,
    failures_remaining: std::sync::atomic::AtomicUsize,
}

impl<C> FlakyTransport<C> {
    pub fn new(inner: C, failures: usize) -> Self {
        Self {
            inner,
            failures_remaining: std::sync::atomic::AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl<C: ReplicationClient> ReplicationClient for FlakyTransport<C> {
    async fn open_stream(&self) -> Result<(mpsc::Sender<Frame>, mpsc::Receiver<Frame>)> {
        let remaining = self
            .failures_remaining
            .load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(ReplicationError::transport(
                "",
                "simulated connection refused",
            ));
        }
        self.inner.open_stream().await
    }

    async fn event_timestamp(
        &self,
        request: proto::EventTimestampRequest,
    ) -> Result<proto::EventTimestampResponse> {
        self.inner.event_timestamp(request).await
    }

    async fn load_event(&self, request: proto::LoadEventRequest) -> Result<proto::LoadEventResponse> {
        self.inner.load_event(request).await
    }
}
