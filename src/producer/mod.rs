// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producer side of the replication protocol.
//!
//! An [`EventProducer`] serves one replication stream per connected
//! consumer worker. Each stream resolves its `stream_id` to an
//! [`EventProducerSource`] (which entity type to read, which static filter
//! to apply), wraps a sliced event source in the dynamic consumer filter,
//! and emits `Event` / `FilteredEvent` messages.
//!
//! # Static vs. dynamic filtering
//!
//! The producer filter is configured here and is permanent: an event it
//! rejects produces nothing on the wire, and the consumer must absorb the
//! resulting seq_nr gap. The consumer filter arrives over the stream and
//! suppressed events still emit a placeholder so the consumer's offset can
//! advance.

mod stream;

use crate::config::ProducerConfig;
use crate::envelope::EventEnvelope;
use crate::error::{ReplicationError, Result};
use crate::journal::EventJournal;
use crate::proto;
use crate::transport::Frame;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Static producer-side predicate. Returning `false` suppresses the event
/// permanently; the consumer never learns of it.
pub type ProducerFilter = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// One publishable event stream: entity type, stream id, static filter.
#[derive(Clone)]
pub struct EventProducerSource {
    entity_type: String,
    stream_id: String,
    producer_filter: Option<ProducerFilter>,
}

impl EventProducerSource {
    pub fn new(entity_type: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            stream_id: stream_id.into(),
            producer_filter: None,
        }
    }

    /// Attach a static producer filter.
    pub fn with_producer_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        self.producer_filter = Some(Arc::new(filter));
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn accepts(&self, envelope: &EventEnvelope) -> bool {
        self.producer_filter
            .as_ref()
            .map_or(true, |filter| filter(envelope))
    }
}

/// Serves replication streams and unary lookups over a journal.
pub struct EventProducer {
    journal: Arc<dyn EventJournal>,
    sources: HashMap<String, EventProducerSource>,
    config: ProducerConfig,
}

impl EventProducer {
    pub fn new(journal: Arc<dyn EventJournal>, config: ProducerConfig) -> Self {
        Self {
            journal,
            sources: HashMap::new(),
            config,
        }
    }

    /// Register a publishable source. Later registrations win on stream id
    /// collision.
    pub fn with_source(mut self, source: EventProducerSource) -> Self {
        self.sources.insert(source.stream_id.clone(), source);
        self
    }

    pub(crate) fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn source_for(&self, stream_id: &str) -> Result<&EventProducerSource> {
        self.sources.get(stream_id).ok_or_else(|| {
            ReplicationError::Protocol(format!("unknown stream id {:?}", stream_id))
        })
    }

    /// Serve one replication stream until either side closes.
    ///
    /// The first inbound frame must be `Init`; anything else fails the
    /// stream with a protocol error. An inbound channel that closes before
    /// `Init` is logged and treated as a clean close.
    pub async fn handle_stream(
        &self,
        inbound: mpsc::Receiver<Frame>,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<()> {
        stream::run_replication_stream(self, inbound, outbound).await
    }

    /// Journal timestamp of one event of this stream's entity type.
    pub async fn event_timestamp(
        &self,
        request: proto::EventTimestampRequest,
    ) -> Result<proto::EventTimestampResponse> {
        let source = self.source_for(&request.stream_id)?;
        let timestamp = self
            .journal
            .event_timestamp(&source.entity_type, &request.persistence_id, request.seq_nr)
            .await?;
        Ok(proto::EventTimestampResponse {
            timestamp: timestamp.map(crate::codec::timestamp_to_proto),
        })
    }

    /// Load one event by `(persistence_id, seq_nr)`.
    ///
    /// Serves consumer-side catch-up of specific entities without
    /// re-scanning slices. An event suppressed by the producer filter comes
    /// back as `FilteredEvent` so the caller keeps sequence continuity.
    pub async fn load_event(
        &self,
        request: proto::LoadEventRequest,
    ) -> Result<proto::LoadEventResponse> {
        let source = self.source_for(&request.stream_id)?;
        let envelope = self
            .journal
            .load_event(&source.entity_type, &request.persistence_id, request.seq_nr)
            .await?
            .ok_or_else(|| {
                ReplicationError::Protocol(format!(
                    "event not found: {} seq_nr {}",
                    request.persistence_id, request.seq_nr
                ))
            })?;

        let message = if source.accepts(&envelope) {
            proto::load_event_response::Message::Event(crate::codec::event_from_envelope(&envelope))
        } else {
            proto::load_event_response::Message::FilteredEvent(
                crate::codec::filtered_event_from_envelope(&envelope),
            )
        };
        Ok(proto::LoadEventResponse {
            message: Some(message),
        })
    }

    pub(crate) fn journal(&self) -> &Arc<dyn EventJournal> {
        &self.journal
    }

    pub(crate) fn config(&self) -> &ProducerConfig {
        &self.config
    }
}
