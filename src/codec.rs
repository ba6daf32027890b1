//! Conversion between domain types and wire messages, plus frame
//! encode/decode.
//!
//! The transport moves opaque frames ([`bytes::Bytes`]); everything typed
//! goes through here. Decode failures are protocol errors and fail the
//! stream.

use crate::envelope::{AnyPayload, EventEnvelope, TimestampOffset};
use crate::error::{ReplicationError, Result};
use crate::filter::{EntityIdOffset, FilterCriteria};
use crate::proto;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_stream_in(message: &proto::StreamIn) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

pub fn decode_stream_in(frame: &Bytes) -> Result<proto::StreamIn> {
    proto::StreamIn::decode(frame.as_ref())
        .map_err(|e| ReplicationError::Protocol(format!("malformed StreamIn frame: {}", e)))
}

pub fn encode_stream_out(message: &proto::StreamOut) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

pub fn decode_stream_out(frame: &Bytes) -> Result<proto::StreamOut> {
    proto::StreamOut::decode(frame.as_ref())
        .map_err(|e| ReplicationError::Protocol(format!("malformed StreamOut frame: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps and offsets
// ─────────────────────────────────────────────────────────────────────────────

pub fn timestamp_to_proto(ts: DateTime<Utc>) -> proto::Timestamp {
    proto::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

pub fn timestamp_from_proto(ts: &proto::Timestamp) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos as u32)
        .single()
        .ok_or_else(|| {
            ReplicationError::Protocol(format!(
                "timestamp out of range: seconds={} nanos={}",
                ts.seconds, ts.nanos
            ))
        })
}

pub fn offset_to_proto(offset: &TimestampOffset) -> proto::Offset {
    proto::Offset {
        timestamp: Some(timestamp_to_proto(offset.timestamp)),
        seen: offset
            .seen
            .iter()
            .map(|(pid, seq_nr)| proto::PersistenceIdSeqNr {
                persistence_id: pid.clone(),
                seq_nr: *seq_nr,
            })
            .collect(),
    }
}

pub fn offset_from_proto(offset: &proto::Offset) -> Result<TimestampOffset> {
    let timestamp = offset
        .timestamp
        .as_ref()
        .ok_or_else(|| ReplicationError::Protocol("offset without timestamp".to_string()))?;
    let mut out = TimestampOffset::new(timestamp_from_proto(timestamp)?);
    for entry in &offset.seen {
        out.seen.insert(entry.persistence_id.clone(), entry.seq_nr);
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter criteria
// ─────────────────────────────────────────────────────────────────────────────

pub fn criterion_to_proto(criterion: &FilterCriteria) -> proto::FilterCriteria {
    use proto::filter_criteria::Message as M;
    let message = match criterion {
        FilterCriteria::ExcludeTags { tags } => {
            M::ExcludeTags(proto::ExcludeTags { tags: tags.clone() })
        }
        FilterCriteria::RemoveExcludeTags { tags } => {
            M::RemoveExcludeTags(proto::RemoveExcludeTags { tags: tags.clone() })
        }
        FilterCriteria::IncludeTags { tags } => {
            M::IncludeTags(proto::IncludeTags { tags: tags.clone() })
        }
        FilterCriteria::RemoveIncludeTags { tags } => {
            M::RemoveIncludeTags(proto::RemoveIncludeTags { tags: tags.clone() })
        }
        FilterCriteria::ExcludeEntityIds { entity_ids } => {
            M::ExcludeEntityIds(proto::ExcludeEntityIds {
                entity_ids: entity_ids.clone(),
            })
        }
        FilterCriteria::RemoveExcludeEntityIds { entity_ids } => {
            M::RemoveExcludeEntityIds(proto::RemoveExcludeEntityIds {
                entity_ids: entity_ids.clone(),
            })
        }
        FilterCriteria::IncludeEntityIds { entity_offsets } => {
            M::IncludeEntityIds(proto::IncludeEntityIds {
                entity_id_offset: entity_offsets
                    .iter()
                    .map(|eo| proto::EntityIdOffset {
                        entity_id: eo.entity_id.clone(),
                        seq_nr: eo.seq_nr,
                    })
                    .collect(),
            })
        }
        FilterCriteria::RemoveIncludeEntityIds { entity_ids } => {
            M::RemoveIncludeEntityIds(proto::RemoveIncludeEntityIds {
                entity_ids: entity_ids.clone(),
            })
        }
        FilterCriteria::ExcludeRegexEntityIds { matching } => {
            M::ExcludeRegexEntityIds(proto::ExcludeRegexEntityIds {
                matching: matching.clone(),
            })
        }
        FilterCriteria::RemoveExcludeRegexEntityIds { matching } => {
            M::RemoveExcludeRegexEntityIds(proto::RemoveExcludeRegexEntityIds {
                matching: matching.clone(),
            })
        }
        FilterCriteria::IncludeRegexEntityIds { matching } => {
            M::IncludeRegexEntityIds(proto::IncludeRegexEntityIds {
                matching: matching.clone(),
            })
        }
        FilterCriteria::RemoveIncludeRegexEntityIds { matching } => {
            M::RemoveIncludeRegexEntityIds(proto::RemoveIncludeRegexEntityIds {
                matching: matching.clone(),
            })
        }
    };
    proto::FilterCriteria {
        message: Some(message),
    }
}

pub fn criterion_from_proto(criterion: &proto::FilterCriteria) -> Result<FilterCriteria> {
    use proto::filter_criteria::Message as M;
    let message = criterion
        .message
        .as_ref()
        .ok_or_else(|| ReplicationError::Protocol("empty filter criterion".to_string()))?;
    Ok(match message {
        M::ExcludeTags(c) => FilterCriteria::ExcludeTags {
            tags: c.tags.clone(),
        },
        M::RemoveExcludeTags(c) => FilterCriteria::RemoveExcludeTags {
            tags: c.tags.clone(),
        },
        M::IncludeTags(c) => FilterCriteria::IncludeTags {
            tags: c.tags.clone(),
        },
        M::RemoveIncludeTags(c) => FilterCriteria::RemoveIncludeTags {
            tags: c.tags.clone(),
        },
        M::ExcludeEntityIds(c) => FilterCriteria::ExcludeEntityIds {
            entity_ids: c.entity_ids.clone(),
        },
        M::RemoveExcludeEntityIds(c) => FilterCriteria::RemoveExcludeEntityIds {
            entity_ids: c.entity_ids.clone(),
        },
        M::IncludeEntityIds(c) => FilterCriteria::IncludeEntityIds {
            entity_offsets: c
                .entity_id_offset
                .iter()
                .map(|eo| EntityIdOffset::new(eo.entity_id.clone(), eo.seq_nr))
                .collect(),
        },
        M::RemoveIncludeEntityIds(c) => FilterCriteria::RemoveIncludeEntityIds {
            entity_ids: c.entity_ids.clone(),
        },
        M::ExcludeRegexEntityIds(c) => FilterCriteria::ExcludeRegexEntityIds {
            matching: c.matching.clone(),
        },
        M::RemoveExcludeRegexEntityIds(c) => FilterCriteria::RemoveExcludeRegexEntityIds {
            matching: c.matching.clone(),
        },
        M::IncludeRegexEntityIds(c) => FilterCriteria::IncludeRegexEntityIds {
            matching: c.matching.clone(),
        },
        M::RemoveIncludeRegexEntityIds(c) => FilterCriteria::RemoveIncludeRegexEntityIds {
            matching: c.matching.clone(),
        },
    })
}

pub fn criteria_to_proto(criteria: &[FilterCriteria]) -> Vec<proto::FilterCriteria> {
    criteria.iter().map(criterion_to_proto).collect()
}

pub fn criteria_from_proto(criteria: &[proto::FilterCriteria]) -> Result<Vec<FilterCriteria>> {
    criteria.iter().map(criterion_from_proto).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

fn any_to_proto(payload: &AnyPayload) -> proto::Any {
    proto::Any {
        type_url: payload.type_url.clone(),
        value: payload.value.clone(),
    }
}

fn any_from_proto(payload: &proto::Any) -> AnyPayload {
    AnyPayload::new(payload.type_url.clone(), payload.value.clone())
}

/// Full event emission for an envelope that passed all filters.
pub fn event_from_envelope(envelope: &EventEnvelope) -> proto::Event {
    proto::Event {
        persistence_id: envelope.persistence_id.clone(),
        seq_nr: envelope.seq_nr,
        slice: envelope.slice as i32,
        offset: Some(offset_to_proto(&envelope.offset)),
        payload: envelope.payload.as_ref().map(any_to_proto),
        source: envelope.source.clone(),
        metadata: envelope.metadata.as_ref().map(any_to_proto),
        tags: envelope.tags.iter().cloned().collect(),
    }
}

/// Placeholder emission for a consumer-filtered envelope.
pub fn filtered_event_from_envelope(envelope: &EventEnvelope) -> proto::FilteredEvent {
    proto::FilteredEvent {
        persistence_id: envelope.persistence_id.clone(),
        seq_nr: envelope.seq_nr,
        slice: envelope.slice as i32,
        offset: Some(offset_to_proto(&envelope.offset)),
        source: envelope.source.clone(),
    }
}

/// Rebuild a consumer-side envelope from a full event.
pub fn envelope_from_event(event: &proto::Event) -> Result<EventEnvelope> {
    let offset = event
        .offset
        .as_ref()
        .ok_or_else(|| ReplicationError::Protocol("event without offset".to_string()))
        .and_then(offset_from_proto)?;
    Ok(EventEnvelope {
        persistence_id: event.persistence_id.clone(),
        seq_nr: event.seq_nr,
        slice: event.slice as u32,
        timestamp: offset.timestamp,
        offset,
        payload: event.payload.as_ref().map(any_from_proto),
        tags: event.tags.iter().cloned().collect(),
        source: event.source.clone(),
        metadata: event.metadata.as_ref().map(any_from_proto),
        filtered: false,
    })
}

/// Rebuild a consumer-side placeholder envelope from a filtered event.
///
/// Carries no payload and is marked `filtered`, so it advances the offset
/// without reaching the handler.
pub fn envelope_from_filtered_event(event: &proto::FilteredEvent) -> Result<EventEnvelope> {
    let offset = event
        .offset
        .as_ref()
        .ok_or_else(|| ReplicationError::Protocol("filtered event without offset".to_string()))
        .and_then(offset_from_proto)?;
    Ok(EventEnvelope {
        persistence_id: event.persistence_id.clone(),
        seq_nr: event.seq_nr,
        slice: event.slice as u32,
        timestamp: offset.timestamp,
        offset,
        payload: None,
        tags: Default::default(),
        source: event.source.clone(),
        metadata: None,
        filtered: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(micros: i64) -> DateTime<Utc> {
        Utc.timestamp_micros(micros).unwrap()
    }

    #[test]
    fn test_timestamp_conversion_preserves_subsecond() {
        let original = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let converted = timestamp_from_proto(&timestamp_to_proto(original)).unwrap();
        assert_eq!(converted, original);
    }

    #[test]
    fn test_offset_conversion() {
        let mut offset = TimestampOffset::single(ts(5_000_000), "x", 4);
        offset.observe(ts(5_000_000), "y", 9);

        let proto = offset_to_proto(&offset);
        assert_eq!(proto.seen.len(), 2);
        let back = offset_from_proto(&proto).unwrap();
        assert_eq!(back, offset);
    }

    #[test]
    fn test_offset_without_timestamp_rejected() {
        let proto = proto::Offset {
            timestamp: None,
            seen: vec![],
        };
        assert!(matches!(
            offset_from_proto(&proto),
            Err(ReplicationError::Protocol(_))
        ));
    }

    #[test]
    fn test_criteria_conversion_all_kinds() {
        let criteria = vec![
            FilterCriteria::ExcludeTags {
                tags: vec!["small".into()],
            },
            FilterCriteria::RemoveExcludeTags {
                tags: vec!["small".into()],
            },
            FilterCriteria::IncludeTags {
                tags: vec!["large".into()],
            },
            FilterCriteria::RemoveIncludeTags {
                tags: vec!["large".into()],
            },
            FilterCriteria::ExcludeEntityIds {
                entity_ids: vec!["a".into()],
            },
            FilterCriteria::RemoveExcludeEntityIds {
                entity_ids: vec!["a".into()],
            },
            FilterCriteria::IncludeEntityIds {
                entity_offsets: vec![EntityIdOffset::new("b", 7)],
            },
            FilterCriteria::RemoveIncludeEntityIds {
                entity_ids: vec!["b".into()],
            },
            FilterCriteria::ExcludeRegexEntityIds {
                matching: vec!["^cart-.*".into()],
            },
            FilterCriteria::RemoveExcludeRegexEntityIds {
                matching: vec!["^cart-.*".into()],
            },
            FilterCriteria::IncludeRegexEntityIds {
                matching: vec!["^vip-.*".into()],
            },
            FilterCriteria::RemoveIncludeRegexEntityIds {
                matching: vec!["^vip-.*".into()],
            },
        ];

        let proto = criteria_to_proto(&criteria);
        let back = criteria_from_proto(&proto).unwrap();
        assert_eq!(back, criteria);
    }

    #[test]
    fn test_empty_criterion_rejected() {
        let empty = proto::FilterCriteria { message: None };
        assert!(criterion_from_proto(&empty).is_err());
    }

    #[test]
    fn test_envelope_event_roundtrip() {
        let envelope = EventEnvelope::new(
            "cart-1",
            3,
            ts(9_000_000),
            Some(AnyPayload::new(
                "type.googleapis.com/shop.ItemAdded",
                vec![1, 2, 3],
            )),
        )
        .with_tags(["large"]);

        let event = event_from_envelope(&envelope);
        let back = envelope_from_event(&event).unwrap();
        assert_eq!(back.persistence_id, envelope.persistence_id);
        assert_eq!(back.seq_nr, envelope.seq_nr);
        assert_eq!(back.slice, envelope.slice);
        assert_eq!(back.timestamp, envelope.timestamp);
        assert_eq!(back.payload, envelope.payload);
        assert_eq!(back.tags, envelope.tags);
        assert!(!back.filtered);
    }

    #[test]
    fn test_filtered_envelope_roundtrip_marks_filtered() {
        let envelope = EventEnvelope::new("cart-1", 7, ts(9_000_000), None);
        let filtered = filtered_event_from_envelope(&envelope);
        let back = envelope_from_filtered_event(&filtered).unwrap();
        assert!(back.filtered);
        assert!(back.payload.is_none());
        assert_eq!(back.seq_nr, 7);
        assert_eq!(back.offset, envelope.offset);
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        let msg = proto::StreamIn {
            message: Some(proto::stream_in::Message::Replay(proto::ReplayReq {
                pid_offsets: vec![proto::PersistenceIdSeqNr {
                    persistence_id: "cart-1".to_string(),
                    seq_nr: 5,
                }],
            })),
        };
        let frame = encode_stream_in(&msg);
        let decoded = decode_stream_in(&frame).unwrap();
        assert_eq!(decoded, msg);
    }
}
