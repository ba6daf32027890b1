// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Journal query capability.
//!
//! The engine never owns event storage; it consumes an ordered, resumable
//! query interface exposed by the journal backend. One implementation exists
//! per storage backend; [`InMemoryJournal`] is bundled for standalone use
//! and tests.
//!
//! # Contract
//!
//! - `seq_nr` is dense and monotonic per persistence id, starting at 1.
//! - Per-entity timestamps are non-decreasing; no global ordering is
//!   assumed.
//! - Slice assignment is the canonical hash
//!   ([`slice_for_persistence_id`](crate::envelope::slice_for_persistence_id));
//!   a backend that hashes differently would route entities to the wrong
//!   workers.
//! - `events_by_slices` returns events with `timestamp >= from`, ordered by
//!   `(timestamp, persistence_id, seq_nr)`. The sliced source applies the
//!   exclusive `seen` filtering on top.

use crate::envelope::{
    slice_for_persistence_id, AnyPayload, EventEnvelope, SliceRange, TimestampOffset,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Query capability of the journal backend.
#[async_trait]
pub trait EventJournal: Send + Sync + 'static {
    /// Read a page of events for `entity_type`, restricted to `slices`,
    /// with `timestamp >= from` (from-beginning when `None`), ordered by
    /// `(timestamp, persistence_id, seq_nr)`, at most `limit` entries.
    async fn events_by_slices(
        &self,
        entity_type: &str,
        slices: SliceRange,
        from: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>>;

    /// All events of one entity with `seq_nr >= from_seq_nr`, in sequence
    /// order. Serves targeted replay.
    async fn events_for_entity(
        &self,
        entity_type: &str,
        persistence_id: &str,
        from_seq_nr: i64,
    ) -> Result<Vec<EventEnvelope>>;

    /// Journal timestamp of one event, if it exists.
    async fn event_timestamp(
        &self,
        entity_type: &str,
        persistence_id: &str,
        seq_nr: i64,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Load one event by `(persistence_id, seq_nr)`.
    async fn load_event(
        &self,
        entity_type: &str,
        persistence_id: &str,
        seq_nr: i64,
    ) -> Result<Option<EventEnvelope>>;
}

#[derive(Debug, Clone)]
struct StoredEvent {
    persistence_id: String,
    seq_nr: i64,
    slice: u32,
    timestamp: DateTime<Utc>,
    payload: Option<AnyPayload>,
    tags: Vec<String>,
}

impl StoredEvent {
    fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            persistence_id: self.persistence_id.clone(),
            seq_nr: self.seq_nr,
            slice: self.slice,
            timestamp: self.timestamp,
            offset: TimestampOffset::single(self.timestamp, &self.persistence_id, self.seq_nr),
            payload: self.payload.clone(),
            tags: self.tags.iter().cloned().collect(),
            source: String::new(),
            metadata: None,
            filtered: false,
        }
    }
}

#[derive(Debug, Default)]
struct EntityTypeLog {
    events: Vec<StoredEvent>,
    /// (last seq_nr, last timestamp) per persistence id.
    heads: HashMap<String, (i64, DateTime<Utc>)>,
}

/// In-memory journal backend.
///
/// Assigns dense sequence numbers from 1 and per-entity non-decreasing
/// timestamps. Suitable for standalone single-process deployments and
/// tests; production backends implement [`EventJournal`] over their store.
#[derive(Default)]
pub struct InMemoryJournal {
    logs: RwLock<HashMap<String, EntityTypeLog>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event with the current wall-clock timestamp (clamped so
    /// per-entity timestamps never go backwards).
    pub async fn append(
        &self,
        entity_type: &str,
        persistence_id: &str,
        payload: AnyPayload,
        tags: Vec<String>,
    ) -> EventEnvelope {
        self.append_internal(entity_type, persistence_id, Utc::now(), Some(payload), tags)
            .await
    }

    /// Append an event at an explicit timestamp.
    ///
    /// The timestamp is clamped to the entity's previous timestamp when
    /// older, preserving per-entity monotonicity. Lets tests construct
    /// events that share an exact timestamp across entities.
    pub async fn append_at(
        &self,
        entity_type: &str,
        persistence_id: &str,
        timestamp: DateTime<Utc>,
        payload: AnyPayload,
        tags: Vec<String>,
    ) -> EventEnvelope {
        self.append_internal(entity_type, persistence_id, timestamp, Some(payload), tags)
            .await
    }

    async fn append_internal(
        &self,
        entity_type: &str,
        persistence_id: &str,
        timestamp: DateTime<Utc>,
        payload: Option<AnyPayload>,
        tags: Vec<String>,
    ) -> EventEnvelope {
        let mut logs = self.logs.write().await;
        let log = logs.entry(entity_type.to_string()).or_default();

        let (seq_nr, timestamp) = match log.heads.get(persistence_id) {
            Some(&(last_seq, last_ts)) => (last_seq + 1, timestamp.max(last_ts)),
            None => (1, timestamp),
        };

        let stored = StoredEvent {
            persistence_id: persistence_id.to_string(),
            seq_nr,
            slice: slice_for_persistence_id(persistence_id),
            timestamp,
            payload,
            tags,
        };
        let envelope = stored.to_envelope();
        log.heads
            .insert(persistence_id.to_string(), (seq_nr, timestamp));
        log.events.push(stored);
        envelope
    }

    /// Number of stored events for an entity type.
    pub async fn len(&self, entity_type: &str) -> usize {
        self.logs
            .read()
            .await
            .get(entity_type)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, entity_type: &str) -> bool {
        self.len(entity_type).await == 0
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn events_by_slices(
        &self,
        entity_type: &str,
        slices: SliceRange,
        from: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(entity_type) else {
            return Ok(Vec::new());
        };

        let mut page: Vec<&StoredEvent> = log
            .events
            .iter()
            .filter(|e| slices.contains(e.slice))
            .filter(|e| from.map_or(true, |f| e.timestamp >= f))
            .collect();
        page.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.persistence_id.cmp(&b.persistence_id))
                .then_with(|| a.seq_nr.cmp(&b.seq_nr))
        });
        page.truncate(limit);

        Ok(page.into_iter().map(StoredEvent::to_envelope).collect())
    }

    async fn events_for_entity(
        &self,
        entity_type: &str,
        persistence_id: &str,
        from_seq_nr: i64,
    ) -> Result<Vec<EventEnvelope>> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(entity_type) else {
            return Ok(Vec::new());
        };

        let mut events: Vec<&StoredEvent> = log
            .events
            .iter()
            .filter(|e| e.persistence_id == persistence_id && e.seq_nr >= from_seq_nr)
            .collect();
        events.sort_by_key(|e| e.seq_nr);
        Ok(events.into_iter().map(StoredEvent::to_envelope).collect())
    }

    async fn event_timestamp(
        &self,
        entity_type: &str,
        persistence_id: &str,
        seq_nr: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let logs = self.logs.read().await;
        Ok(logs.get(entity_type).and_then(|log| {
            log.events
                .iter()
                .find(|e| e.persistence_id == persistence_id && e.seq_nr == seq_nr)
                .map(|e| e.timestamp)
        }))
    }

    async fn load_event(
        &self,
        entity_type: &str,
        persistence_id: &str,
        seq_nr: i64,
    ) -> Result<Option<EventEnvelope>> {
        let logs = self.logs.read().await;
        Ok(logs.get(entity_type).and_then(|log| {
            log.events
                .iter()
                .find(|e| e.persistence_id == persistence_id && e.seq_nr == seq_nr)
                .map(StoredEvent::to_envelope)
        }))
    }
}
