// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sliced event source: a resumable, slice-restricted, offset-addressable
//! view of the journal.
//!
//! # Two phases
//!
//! The source first scans history in full pages (catch-up), then follows
//! live appends by polling (tailing). The switch is transparent to the
//! caller: [`SlicedEventSource::next()`] just yields the next envelope.
//!
//! # Tail lag window
//!
//! During tailing, an event with timestamp `t` is withheld until wall clock
//! reaches `t + behind_current_time`. Inserts commit out of order near the
//! head; the lag window keeps a slightly older event from being skipped
//! because a newer one was read first.
//!
//! # Resumption contract
//!
//! Given a resume offset `(T, seen)`, the next emitted envelope satisfies
//! `timestamp > T`, or `timestamp == T` with a `(persistence_id, seq_nr)`
//! not covered by `seen`. Nothing recorded in `seen` is ever re-delivered.

use crate::envelope::{EventEnvelope, SliceRange, TimestampOffset};
use crate::error::{ReplicationError, Result};
use crate::journal::EventJournal;
use crate::metrics;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded local retry for journal reads before the error becomes a stream
/// failure.
const JOURNAL_READ_ATTEMPTS: u32 = 3;
const JOURNAL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Resumable pull-based stream over one entity type and slice range.
pub struct SlicedEventSource {
    journal: Arc<dyn EventJournal>,
    entity_type: String,
    slice_range: SliceRange,
    offset: Option<TimestampOffset>,
    behind_current_time: Duration,
    poll_interval: Duration,
    page_size: usize,
    buffer: VecDeque<EventEnvelope>,
    catching_up: bool,
}

impl SlicedEventSource {
    pub fn new(
        journal: Arc<dyn EventJournal>,
        entity_type: impl Into<String>,
        slice_range: SliceRange,
        offset: Option<TimestampOffset>,
        behind_current_time: Duration,
        poll_interval: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            journal,
            entity_type: entity_type.into(),
            slice_range,
            offset,
            behind_current_time,
            poll_interval,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            catching_up: true,
        }
    }

    /// The cursor after the most recently emitted envelope.
    pub fn current_offset(&self) -> Option<&TimestampOffset> {
        self.offset.as_ref()
    }

    /// Whether the source is still scanning history.
    pub fn is_catching_up(&self) -> bool {
        self.catching_up
    }

    /// Yield the next envelope, waiting for live appends once caught up.
    ///
    /// The envelope's `offset` field is rewritten to the accumulated resume
    /// cursor as of its emission. Never returns `Ok` with a re-delivery of
    /// anything the cursor covers.
    pub async fn next(&mut self) -> Result<EventEnvelope> {
        loop {
            if let Some(mut envelope) = self.buffer.pop_front() {
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
                        let offset = TimestampOffset::single(
                            envelope.timestamp,
                            &envelope.persistence_id,
                            envelope.seq_nr,
                        );
                        self.offset = Some(offset.clone());
                        offset
                    }
                };
                envelope.offset = offset;
                return Ok(envelope);
            }

            self.fill_buffer().await?;

            if self.buffer.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Read the next page and keep only admissible envelopes.
    async fn fill_buffer(&mut self) -> Result<()> {
        let mut limit = self.page_size;

        loop {
            let from = self.offset.as_ref().map(|o| o.timestamp);
            let page = self.read_page(from, limit).await?;
            let page_len = page.len();

            let cutoff = Utc::now()
                - ChronoDuration::from_std(self.behind_current_time)
                    .unwrap_or_else(|_| ChronoDuration::milliseconds(500));

            let mut withheld = 0usize;
            for envelope in page {
                if let Some(offset) = &self.offset {
                    if offset.covers(
                        envelope.timestamp,
                        &envelope.persistence_id,
                        envelope.seq_nr,
                    ) {
                        continue;
                    }
                }
                if envelope.timestamp > cutoff {
                    withheld += 1;
                    continue;
                }
                self.buffer.push_back(envelope);
            }

            let was_full = page_len == limit;
            if self.catching_up && !was_full {
                self.catching_up = false;
                debug!(
                    entity_type = %self.entity_type,
                    slice_range = %self.slice_range,
                    "Caught up with journal, switching to live tailing"
                );
            }

            if !self.buffer.is_empty() || !was_full || withheld > 0 {
                return Ok(());
            }

            // A full page where everything was already covered: more events
            // share the cursor timestamp than fit in one page. Widen the
            // read so the cursor can make progress.
            limit = limit.saturating_mul(2);
            debug!(
                entity_type = %self.entity_type,
                limit,
                "Page exhausted by covered events, widening read"
            );
        }
    }

    async fn read_page(
        &self,
        from: Option<chrono::DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .journal
                .events_by_slices(&self.entity_type, self.slice_range, from, limit)
                .await
            {
                Ok(page) => {
                    if !page.is_empty() {
                        metrics::record_journal_events_read(&self.entity_type, page.len());
                    }
                    return Ok(page);
                }
                Err(e) if attempt < JOURNAL_READ_ATTEMPTS && e.is_retryable() => {
                    warn!(
                        entity_type = %self.entity_type,
                        attempt,
                        error = %e,
                        "Journal read failed, retrying"
                    );
                    metrics::record_journal_read_retry(&self.entity_type);
                    tokio::time::sleep(JOURNAL_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(ReplicationError::Journal(format!(
                        "journal read failed after {} attempts: {}",
                        attempt, e
                    )))
                }
            }
        }
    }
}
