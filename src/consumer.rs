//! Consumer-side source provider.
//!
//! An [`EventSourceProvider`] opens a replication stream against a producer
//! and yields envelopes for a projection. It owns the transport lifecycle:
//! on disconnect it reconnects indefinitely with bounded exponential
//! backoff, re-sending `Init` with the freshest offset it knows and the
//! current filter snapshot. Filter state on the producer only lives as
//! long as the stream, so it is re-established on every connect.
//!
//! Filter changes made through the [`ConsumerFilterRegistry`] mid-stream
//! are forwarded incrementally as `Filter` diffs against the last state
//! this worker sent.

use crate::codec;
use crate::envelope::{EventEnvelope, SliceRange, TimestampOffset};
use crate::filter::{ConsumerFilterRegistry, FilterState};
use crate::metrics;
use crate::proto::{self, stream_in, stream_out, StreamIn};
use crate::resilience::RestartBackoff;
use crate::transport::{Frame, ReplicationClient};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Factory for resilient envelope sources over one stream and slice range.
pub struct EventSourceProvider {
    client: Arc<dyn ReplicationClient>,
    stream_id: String,
    slice_range: SliceRange,
    filter_registry: Option<Arc<ConsumerFilterRegistry>>,
    reconnect_backoff: RestartBackoff,
}

impl EventSourceProvider {
    pub fn new(
        client: Arc<dyn ReplicationClient>,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
    ) -> Self {
        Self {
            client,
            stream_id: stream_id.into(),
            slice_range,
            filter_registry: None,
            reconnect_backoff: RestartBackoff::default(),
        }
    }

    /// Subscribe this provider's streams to a shared filter registry.
    pub fn with_filter_registry(mut self, registry: Arc<ConsumerFilterRegistry>) -> Self {
        self.filter_registry = Some(registry);
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn slice_range(&self) -> SliceRange {
        self.slice_range
    }

    /// Open an envelope source resuming from `offset`.
    pub fn source(&self, offset: Option<TimestampOffset>) -> EnvelopeSource {
        EnvelopeSource {
            client: Arc::clone(&self.client),
            stream_id: self.stream_id.clone(),
            slice_range: self.slice_range,
            filter_rx: self
                .filter_registry
                .as_ref()
                .map(|registry| registry.subscribe(&self.stream_id)),
            sent_filter: FilterState::new(),
            backoff: self.reconnect_backoff.clone(),
            offset,
            connection: None,
            attempt: 0,
        }
    }
}

struct Connection {
    in_tx: mpsc::Sender<Frame>,
    out_rx: mpsc::Receiver<Frame>,
}

enum StreamEvent {
    FilterChanged(bool),
    Frame(Option<Frame>),
}

/// A live, self-healing envelope stream.
pub struct EnvelopeSource {
    client: Arc<dyn ReplicationClient>,
    stream_id: String,
    slice_range: SliceRange,
    filter_rx: Option<watch::Receiver<Vec<crate::filter::FilterCriteria>>>,
    /// Filter state as last communicated to the producer; diffs are
    /// computed against this.
    sent_filter: FilterState,
    backoff: RestartBackoff,
    offset: Option<TimestampOffset>,
    connection: Option<Connection>,
    attempt: usize,
}

impl EnvelopeSource {
    /// The freshest offset this source has observed.
    pub fn current_offset(&self) -> Option<&TimestampOffset> {
        self.offset.as_ref()
    }

    /// Request targeted replay of specific entities from a seq_nr floor.
    ///
    /// Best-effort: a disconnect before the request lands drops it; resend
    /// after reconnect if the replay still matters.
    pub async fn request_replay(&mut self, pid_offsets: Vec<(String, i64)>) {
        let Some(connection) = self.connection.as_ref() else {
            debug!("Replay requested while disconnected, dropping");
            return;
        };
        let frame = codec::encode_stream_in(&StreamIn {
            message: Some(stream_in::Message::Replay(proto::ReplayReq {
                pid_offsets: pid_offsets
                    .into_iter()
                    .map(|(persistence_id, seq_nr)| proto::PersistenceIdSeqNr {
                        persistence_id,
                        seq_nr,
                    })
                    .collect(),
            })),
        });
        if connection.in_tx.send(frame).await.is_err() {
            self.connection = None;
        }
    }

    /// Yield the next envelope, reconnecting as needed.
    ///
    /// Never gives up: transport failures back off and retry forever, and a
    /// malformed frame (protocol error) is logged loudly, then retried
    /// after the full backoff ceiling so the failure stays operator-visible.
    pub async fn next(&mut self) -> EventEnvelope {
        loop {
            if self.connection.is_none() {
                self.connect().await;
                continue;
            }

            let event = {
                let connection = self.connection.as_mut().expect("connected above");
                let filter_rx = self.filter_rx.as_mut();
                tokio::select! {
                    biased;

                    changed = filter_changed(filter_rx) => StreamEvent::FilterChanged(changed),
                    frame = connection.out_rx.recv() => StreamEvent::Frame(frame),
                }
            };

            match event {
                StreamEvent::FilterChanged(true) => {
                    self.forward_filter_diff().await;
                }
                StreamEvent::FilterChanged(false) => {
                    // Registry dropped; stop watching.
                    self.filter_rx = None;
                }
                StreamEvent::Frame(None) => {
                    warn!(stream_id = %self.stream_id, "Replication stream disconnected");
                    self.connection = None;
                }
                StreamEvent::Frame(Some(frame)) => match self.decode_envelope(&frame) {
                    Ok(mut envelope) => {
                        self.attempt = 0;
                        let offset = match self.offset.as_mut() {
                            Some(offset) => {
                                offset.observe(
                                    envelope.timestamp,
                                    &envelope.persistence_id,
                                    envelope.seq_nr,
                                );
                                offset.clone()
                            }
                            None => {
                                let offset = envelope.offset.clone();
                                self.offset = Some(offset.clone());
                                offset
                            }
                        };
                        // Normalize: replayed envelopes carry cursors that
                        // predate the live stream; the projection always
                        // commits the merged cursor.
                        envelope.offset = offset;
                        return envelope;
                    }
                    Err(e) => {
                        error!(
                            stream_id = %self.stream_id,
                            error = %e,
                            "Protocol error on replication stream"
                        );
                        self.connection = None;
                        tokio::time::sleep(self.backoff.max_backoff()).await;
                    }
                },
            }
        }
    }

    async fn connect(&mut self) {
        self.attempt += 1;
        if self.attempt > 1 {
            let delay = self.backoff.next_delay(self.attempt - 1);
            metrics::record_reconnect(&self.stream_id);
            debug!(
                stream_id = %self.stream_id,
                attempt = self.attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let (in_tx, out_rx) = match self.client.open_stream().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    stream_id = %self.stream_id,
                    attempt = self.attempt,
                    error = %e,
                    "Failed to open replication stream"
                );
                return;
            }
        };

        // Filter state is per-stream on the producer: re-establish the
        // full snapshot with every Init.
        let snapshot = self
            .filter_rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        let mut sent_filter = FilterState::new();
        if let Err(e) = sent_filter.apply(&snapshot, usize::MAX) {
            // The registry validated these criteria already.
            error!(stream_id = %self.stream_id, error = %e, "Unusable filter snapshot");
        }

        let init = StreamIn {
            message: Some(stream_in::Message::Init(proto::InitReq {
                stream_id: self.stream_id.clone(),
                slice_min: self.slice_range.min as i32,
                slice_max: self.slice_range.max as i32,
                offset: self.offset.as_ref().map(codec::offset_to_proto),
                filter: codec::criteria_to_proto(&snapshot),
            })),
        };
        if in_tx.send(codec::encode_stream_in(&init)).await.is_err() {
            warn!(stream_id = %self.stream_id, "Stream closed before Init was sent");
            return;
        }

        info!(
            stream_id = %self.stream_id,
            slice_range = %self.slice_range,
            from_offset = ?self.offset.as_ref().map(|o| o.timestamp),
            filter_criteria = snapshot.len(),
            "Replication stream opened"
        );
        self.sent_filter = sent_filter;
        self.connection = Some(Connection { in_tx, out_rx });
    }

    /// Send the registry's latest criteria as a diff against what this
    /// worker already sent.
    async fn forward_filter_diff(&mut self) {
        let Some(rx) = self.filter_rx.as_ref() else {
            return;
        };
        let snapshot = rx.borrow().clone();

        let mut target = FilterState::new();
        if target.apply(&snapshot, usize::MAX).is_err() {
            return;
        }
        let diff = self.sent_filter.diff(&target);
        if diff.is_empty() {
            self.sent_filter = target;
            return;
        }

        let Some(connection) = self.connection.as_ref() else {
            // The next connect sends the full snapshot anyway.
            return;
        };
        let frame = codec::encode_stream_in(&StreamIn {
            message: Some(stream_in::Message::Filter(proto::FilterReq {
                criteria: codec::criteria_to_proto(&diff),
            })),
        });
        match connection.in_tx.send(frame).await {
            Ok(()) => {
                debug!(
                    stream_id = %self.stream_id,
                    criteria = diff.len(),
                    "Forwarded filter update"
                );
                self.sent_filter = target;
            }
            Err(_) => {
                self.connection = None;
            }
        }
    }

    fn decode_envelope(&self, frame: &Frame) -> crate::error::Result<EventEnvelope> {
        match codec::decode_stream_out(frame)?.message {
            Some(stream_out::Message::Event(event)) => codec::envelope_from_event(&event),
            Some(stream_out::Message::FilteredEvent(event)) => {
                codec::envelope_from_filtered_event(&event)
            }
            None => Err(crate::error::ReplicationError::Protocol(
                "empty StreamOut message".to_string(),
            )),
        }
    }
}

async fn filter_changed(
    rx: Option<&mut watch::Receiver<Vec<crate::filter::FilterCriteria>>>,
) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
