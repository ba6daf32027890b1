//! Wire messages for the replication protocol.
//!
//! Declared directly with `prost` derives so frames are canonical protobuf
//! bytes without a build-time codegen step. Field numbers are part of the
//! wire contract; never renumber.
//!
//! Client to server: [`StreamIn`] (`Init`, then `Filter` / `Replay`).
//! Server to client: [`StreamOut`] (`Event` / `FilteredEvent`).
//! Unary lookups: [`EventTimestampRequest`] / [`LoadEventRequest`].

/// Protobuf-style timestamp: seconds since the Unix epoch plus nanos.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

/// Opaque payload: a stable type URL and serialized bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PersistenceIdSeqNr {
    #[prost(string, tag = "1")]
    pub persistence_id: String,
    #[prost(int64, tag = "2")]
    pub seq_nr: i64,
}

/// Resume cursor: timestamp plus entities already delivered at exactly that
/// timestamp. An absent offset in `InitReq` means "from the beginning".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Offset {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(message, repeated, tag = "2")]
    pub seen: Vec<PersistenceIdSeqNr>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter criteria
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExcludeTags {
    #[prost(string, repeated, tag = "1")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveExcludeTags {
    #[prost(string, repeated, tag = "1")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncludeTags {
    #[prost(string, repeated, tag = "1")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveIncludeTags {
    #[prost(string, repeated, tag = "1")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExcludeEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub entity_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveExcludeEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub entity_ids: Vec<String>,
}

/// Entity id with a replay floor; `seq_nr > 0` requests replay from that
/// sequence number (inclusive).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntityIdOffset {
    #[prost(string, tag = "1")]
    pub entity_id: String,
    #[prost(int64, tag = "2")]
    pub seq_nr: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncludeEntityIds {
    #[prost(message, repeated, tag = "1")]
    pub entity_id_offset: Vec<EntityIdOffset>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveIncludeEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub entity_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExcludeRegexEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub matching: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveExcludeRegexEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub matching: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncludeRegexEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub matching: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveIncludeRegexEntityIds {
    #[prost(string, repeated, tag = "1")]
    pub matching: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilterCriteria {
    #[prost(
        oneof = "filter_criteria::Message",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12"
    )]
    pub message: Option<filter_criteria::Message>,
}

pub mod filter_criteria {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ExcludeTags(super::ExcludeTags),
        #[prost(message, tag = "2")]
        RemoveExcludeTags(super::RemoveExcludeTags),
        #[prost(message, tag = "3")]
        IncludeTags(super::IncludeTags),
        #[prost(message, tag = "4")]
        RemoveIncludeTags(super::RemoveIncludeTags),
        #[prost(message, tag = "5")]
        ExcludeEntityIds(super::ExcludeEntityIds),
        #[prost(message, tag = "6")]
        RemoveExcludeEntityIds(super::RemoveExcludeEntityIds),
        #[prost(message, tag = "7")]
        IncludeEntityIds(super::IncludeEntityIds),
        #[prost(message, tag = "8")]
        RemoveIncludeEntityIds(super::RemoveIncludeEntityIds),
        #[prost(message, tag = "9")]
        ExcludeRegexEntityIds(super::ExcludeRegexEntityIds),
        #[prost(message, tag = "10")]
        RemoveExcludeRegexEntityIds(super::RemoveExcludeRegexEntityIds),
        #[prost(message, tag = "11")]
        IncludeRegexEntityIds(super::IncludeRegexEntityIds),
        #[prost(message, tag = "12")]
        RemoveIncludeRegexEntityIds(super::RemoveIncludeRegexEntityIds),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client -> server
// ─────────────────────────────────────────────────────────────────────────────

/// First message of every stream: which stream, which slices, where to
/// resume, and the initial filter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitReq {
    #[prost(string, tag = "1")]
    pub stream_id: String,
    #[prost(int32, tag = "2")]
    pub slice_min: i32,
    #[prost(int32, tag = "3")]
    pub slice_max: i32,
    #[prost(message, optional, tag = "4")]
    pub offset: Option<Offset>,
    #[prost(message, repeated, tag = "5")]
    pub filter: Vec<FilterCriteria>,
}

/// Incremental filter mutation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilterReq {
    #[prost(message, repeated, tag = "1")]
    pub criteria: Vec<FilterCriteria>,
}

/// Targeted replay of specific entities from a seq_nr floor (inclusive).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplayReq {
    #[prost(message, repeated, tag = "1")]
    pub pid_offsets: Vec<PersistenceIdSeqNr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamIn {
    #[prost(oneof = "stream_in::Message", tags = "1, 2, 3")]
    pub message: Option<stream_in::Message>,
}

pub mod stream_in {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Init(super::InitReq),
        #[prost(message, tag = "2")]
        Filter(super::FilterReq),
        #[prost(message, tag = "3")]
        Replay(super::ReplayReq),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server -> client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub persistence_id: String,
    #[prost(int64, tag = "2")]
    pub seq_nr: i64,
    #[prost(int32, tag = "3")]
    pub slice: i32,
    #[prost(message, optional, tag = "4")]
    pub offset: Option<Offset>,
    #[prost(message, optional, tag = "5")]
    pub payload: Option<Any>,
    #[prost(string, tag = "6")]
    pub source: String,
    #[prost(message, optional, tag = "7")]
    pub metadata: Option<Any>,
    #[prost(string, repeated, tag = "8")]
    pub tags: Vec<String>,
}

/// Placeholder for an event suppressed by the consumer filter; preserves
/// `(persistence_id, seq_nr)` continuity so the consumer can advance its
/// offset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilteredEvent {
    #[prost(string, tag = "1")]
    pub persistence_id: String,
    #[prost(int64, tag = "2")]
    pub seq_nr: i64,
    #[prost(int32, tag = "3")]
    pub slice: i32,
    #[prost(message, optional, tag = "4")]
    pub offset: Option<Offset>,
    #[prost(string, tag = "5")]
    pub source: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamOut {
    #[prost(oneof = "stream_out::Message", tags = "1, 2")]
    pub message: Option<stream_out::Message>,
}

pub mod stream_out {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Event(super::Event),
        #[prost(message, tag = "2")]
        FilteredEvent(super::FilteredEvent),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unary lookups
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventTimestampRequest {
    #[prost(string, tag = "1")]
    pub stream_id: String,
    #[prost(string, tag = "2")]
    pub persistence_id: String,
    #[prost(int64, tag = "3")]
    pub seq_nr: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventTimestampResponse {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadEventRequest {
    #[prost(string, tag = "1")]
    pub stream_id: String,
    #[prost(string, tag = "2")]
    pub persistence_id: String,
    #[prost(int64, tag = "3")]
    pub seq_nr: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadEventResponse {
    #[prost(oneof = "load_event_response::Message", tags = "1, 2")]
    pub message: Option<load_event_response::Message>,
}

pub mod load_event_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Event(super::Event),
        #[prost(message, tag = "2")]
        FilteredEvent(super::FilteredEvent),
    }
}
