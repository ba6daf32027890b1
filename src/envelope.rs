//! Core domain types: envelopes, offsets, slices, projection identity.
//!
//! # Slices
//!
//! Every persistence id maps to one of 1024 slices via a bit-stable hash.
//! Slices are the unit of parallel partitioning: a projection worker owns a
//! contiguous slice range and only ever sees events whose slice falls inside
//! it. The hash must be identical on the producer and every journal backend,
//! otherwise an entity's events land in the wrong worker's stream.
//!
//! # Offsets
//!
//! A [`TimestampOffset`] is the durable resume cursor: the timestamp of the
//! last emitted event plus, for entities that share exactly that timestamp,
//! the highest sequence number already delivered. Resuming from an offset
//! never re-delivers a `(persistence_id, seq_nr)` recorded in `seen`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Total number of slices. Fixed by the wire contract.
pub const NUMBER_OF_SLICES: u32 = 1024;

/// Journal source marker for backtracking redeliveries.
pub const SOURCE_BACKTRACKING: &str = "BT";

/// Murmur3 x86 32-bit. Used for slice assignment; must stay bit-stable
/// across platforms and releases.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= u32::from(b) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Deterministic slice for a persistence id: `murmur3(utf8(pid)) mod 1024`.
pub fn slice_for_persistence_id(persistence_id: &str) -> u32 {
    murmur3_32(persistence_id.as_bytes(), 0) % NUMBER_OF_SLICES
}

/// A contiguous, inclusive range of slices owned by one projection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceRange {
    pub min: u32,
    pub max: u32,
}

impl SliceRange {
    /// Create a range. Panics if `min > max` or `max >= 1024`.
    pub fn new(min: u32, max: u32) -> Self {
        assert!(min <= max, "slice range min {} > max {}", min, max);
        assert!(max < NUMBER_OF_SLICES, "slice range max {} out of bounds", max);
        Self { min, max }
    }

    /// The full `[0, 1023]` range.
    pub fn full() -> Self {
        Self::new(0, NUMBER_OF_SLICES - 1)
    }

    pub fn contains(&self, slice: u32) -> bool {
        slice >= self.min && slice <= self.max
    }

    pub fn len(&self) -> usize {
        (self.max - self.min + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false // min <= max is enforced at construction
    }
}

impl std::fmt::Display for SliceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Partition `[0, 1024)` into `n` contiguous, disjoint, covering ranges.
///
/// Ranges are as equal as possible; the last one absorbs `1024 mod n`.
/// Panics if `n` is zero or greater than 1024.
pub fn slice_ranges(n: usize) -> Vec<SliceRange> {
    assert!(n > 0, "number of ranges must be positive");
    assert!(
        n <= NUMBER_OF_SLICES as usize,
        "number of ranges {} exceeds number of slices",
        n
    );

    let base = NUMBER_OF_SLICES / n as u32;
    let mut ranges = Vec::with_capacity(n);
    for i in 0..n as u32 {
        let min = i * base;
        let max = if i == n as u32 - 1 {
            NUMBER_OF_SLICES - 1
        } else {
            min + base - 1
        };
        ranges.push(SliceRange::new(min, max));
    }
    ranges
}

/// Resume cursor: a timestamp plus the entities already delivered at exactly
/// that timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampOffset {
    /// Timestamp of the most recently delivered event.
    pub timestamp: DateTime<Utc>,
    /// Highest delivered seq_nr per persistence id, only for entities whose
    /// event timestamp equals `timestamp` exactly.
    pub seen: BTreeMap<String, i64>,
}

impl TimestampOffset {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            seen: BTreeMap::new(),
        }
    }

    /// Offset for a single event: `seen` holds just that entity.
    pub fn single(timestamp: DateTime<Utc>, persistence_id: &str, seq_nr: i64) -> Self {
        let mut seen = BTreeMap::new();
        seen.insert(persistence_id.to_string(), seq_nr);
        Self { timestamp, seen }
    }

    /// Advance the cursor past an event.
    ///
    /// A strictly newer timestamp resets `seen` to just this entity; an
    /// equal timestamp inserts or raises the entity's entry.
    pub fn observe(&mut self, timestamp: DateTime<Utc>, persistence_id: &str, seq_nr: i64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
            self.seen.clear();
            self.seen.insert(persistence_id.to_string(), seq_nr);
        } else if timestamp == self.timestamp {
            let entry = self.seen.entry(persistence_id.to_string()).or_insert(seq_nr);
            if *entry < seq_nr {
                *entry = seq_nr;
            }
        }
        // Older timestamps (replay) leave the cursor untouched.
    }

    /// Whether an event at `(timestamp, persistence_id, seq_nr)` is already
    /// covered by this offset and must not be re-delivered.
    pub fn covers(&self, timestamp: DateTime<Utc>, persistence_id: &str, seq_nr: i64) -> bool {
        if timestamp < self.timestamp {
            return true;
        }
        if timestamp > self.timestamp {
            return false;
        }
        self.seen
            .get(persistence_id)
            .is_some_and(|&delivered| delivered >= seq_nr)
    }
}

/// Opaque payload container: a stable type URL plus serialized bytes.
///
/// The engine never deserializes application events; `(type_url, value)`
/// travel verbatim from producer to consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyPayload {
    /// `"type.googleapis.com/<fully.qualified.name>"`.
    pub type_url: String,
    pub value: Vec<u8>,
}

impl AnyPayload {
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }
}

/// One journaled event with its addressing and tagging metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub persistence_id: String,
    /// Monotonic per persistence id, dense, starting at 1.
    pub seq_nr: i64,
    pub slice: u32,
    /// Event timestamp as recorded by the journal.
    pub timestamp: DateTime<Utc>,
    /// Resume cursor as of this envelope's emission.
    pub offset: TimestampOffset,
    /// `None` for filtered placeholders and backtracking redeliveries.
    pub payload: Option<AnyPayload>,
    pub tags: BTreeSet<String>,
    /// Journal source marker; `""` for regular events, `"BT"` for
    /// backtracking redeliveries.
    pub source: String,
    pub metadata: Option<AnyPayload>,
    /// True when this envelope is a placeholder for an event suppressed by
    /// the consumer filter. Advances the offset; skips the handler.
    pub filtered: bool,
}

impl EventEnvelope {
    /// Build an envelope with the slice derived from the persistence id and
    /// a single-entity offset.
    pub fn new(
        persistence_id: impl Into<String>,
        seq_nr: i64,
        timestamp: DateTime<Utc>,
        payload: Option<AnyPayload>,
    ) -> Self {
        let persistence_id = persistence_id.into();
        let slice = slice_for_persistence_id(&persistence_id);
        let offset = TimestampOffset::single(timestamp, &persistence_id, seq_nr);
        Self {
            persistence_id,
            seq_nr,
            slice,
            timestamp,
            offset,
            payload,
            tags: BTreeSet::new(),
            source: String::new(),
            metadata: None,
            filtered: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_backtracking(&self) -> bool {
        self.source == SOURCE_BACKTRACKING
    }
}

/// Identity of one projection instance: `(name, key)`.
///
/// Uniqueness is load-bearing: two live projections sharing a ProjectionId
/// write to the same offset row and corrupt each other's progress. The
/// sharded daemon guarantees uniqueness by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectionId {
    name: String,
    key: String,
}

impl ProjectionId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// Standard key derivation for replicated projections:
    /// `{stream_id}-{slice_min}-{slice_max}`.
    pub fn for_slice_range(name: impl Into<String>, stream_id: &str, range: SliceRange) -> Self {
        Self::new(name, format!("{}-{}-{}", stream_id, range.min, range.max))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for ProjectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.key)
    }
}
