//! # Event Replication
//!
//! Broker-less, effectively-once event replication between services.
//! A producer streams persisted, ordered events straight to consumer
//! services over a bidirectional protocol; consumers materialize
//! projections whose progress is a durable offset per projection instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────── producer service ─────────────────────────────┐
//! │  ┌──────────────┐    ┌───────────────────┐    ┌─────────────────────────┐  │
//! │  │ EventJournal │───►│ SlicedEventSource │───►│ stream engine + filters │  │
//! │  │ (storage)    │    │ (catch-up + tail) │    │ (Event/FilteredEvent)   │  │
//! │  └──────────────┘    └───────────────────┘    └───────────┬─────────────┘  │
//! └───────────────────────────────────────────────────────────┼────────────────┘
//!                             Init / Filter / Replay          │ frames
//! ┌───────────────────────────── consumer service ────────────┼────────────────┐
//! │  ┌───────────────┐    ┌─────────────────────┐    ┌────────▼─────────────┐  │
//! │  │ ShardedDaemon │───►│ Projection runtime  │◄───│ EventSourceProvider  │  │
//! │  │ (N workers)   │    │ (handler + offsets) │    │ (reconnect, filters) │  │
//! │  └───────────────┘    └──────────┬──────────┘    └──────────────────────┘  │
//! │                                  ▼                                         │
//! │                            ┌─────────────┐                                 │
//! │                            │ OffsetStore │                                 │
//! │                            │ (SQLite)    │                                 │
//! │                            └─────────────┘                                 │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_replication::config::{ConsumerConfig, ProducerConfig};
//! use event_replication::envelope::{slice_ranges, ProjectionId};
//! use event_replication::journal::InMemoryJournal;
//! use event_replication::producer::{EventProducer, EventProducerSource};
//! use event_replication::transport::InProcessTransport;
//! use std::sync::Arc;
//!
//! # fn main() {
//! let journal = Arc::new(InMemoryJournal::new());
//! let producer = Arc::new(
//!     EventProducer::new(journal, ProducerConfig::default())
//!         .with_source(EventProducerSource::new("ShoppingCart", "cart")),
//! );
//! let client = Arc::new(InProcessTransport::new(producer));
//!
//! // Four workers, each pinned to a quarter of the slice space.
//! for (i, range) in slice_ranges(4).iter().enumerate() {
//!     let projection_id = ProjectionId::for_slice_range("cart-events", "cart", *range);
//!     let _ = (i, projection_id);
//!     // build an EventSourceProvider per range and hand it to a Projection
//! }
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod consumer;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod journal;
pub mod metrics;
pub mod offset_store;
pub mod producer;
pub mod projection;
pub mod proto;
pub mod resilience;
pub mod source;
pub mod transport;

// Re-exports for convenience
pub use config::{ConsumerConfig, OffsetStoreConfig, ProducerConfig};
pub use consumer::{EnvelopeSource, EventSourceProvider};
pub use daemon::{ClusterMembership, DaemonHandle, ShardedDaemon};
pub use envelope::{
    slice_for_persistence_id, slice_ranges, AnyPayload, EventEnvelope, ProjectionId, SliceRange,
    TimestampOffset, NUMBER_OF_SLICES,
};
pub use error::{ReplicationError, Result};
pub use filter::{ConsumerFilterRegistry, EntityIdOffset, FilterCriteria};
pub use journal::{EventJournal, InMemoryJournal};
pub use offset_store::OffsetStore;
pub use producer::{EventProducer, EventProducerSource};
pub use projection::{
    ExactlyOnceHandler, GroupedHandler, Handler, Projection, ProjectionHandle,
};
pub use source::SlicedEventSource;
pub use transport::{InProcessTransport, ReplicationClient};
