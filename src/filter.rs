//! Consumer filter criteria and evaluation.
//!
//! Filters run on the producer so suppressed events never cross the wire as
//! full payloads. Criteria arrive from the consumer, either in the initial
//! `Init` message or incrementally via `Filter` messages, and mutate a
//! per-stream [`FilterState`].
//!
//! # Evaluation order
//!
//! 1. If any `Exclude*` criterion matches, the envelope is tentatively
//!    suppressed.
//! 2. A suppressed envelope is re-included if any `Include*` criterion
//!    matches; otherwise it goes out as a filtered placeholder.
//! 3. An envelope no `Exclude*` matches is emitted as a full event.
//!
//! Tag criteria match any-of against the envelope's tag set, entity-id
//! criteria match the persistence id literally, regex criteria match the
//! persistence id against compiled patterns.
//!
//! # Mutation semantics
//!
//! Adding a criterion that is already present is a no-op, as is removing an
//! absent one, so the same `Filter` batch can be applied twice without
//! changing the outcome. `Remove*` matches the original add by value.

use crate::envelope::EventEnvelope;
use crate::error::{ReplicationError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::watch;

/// An entity id paired with a sequence number floor.
///
/// A floor above zero asks the producer to replay that entity from the
/// floor (inclusive) when the include criterion is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdOffset {
    pub entity_id: String,
    /// Replay floor; `0` means include from now on without replay.
    pub seq_nr: i64,
}

impl EntityIdOffset {
    pub fn new(entity_id: impl Into<String>, seq_nr: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            seq_nr,
        }
    }
}

/// One filter mutation, as carried by `Init` and `Filter` messages.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCriteria {
    ExcludeTags { tags: Vec<String> },
    RemoveExcludeTags { tags: Vec<String> },
    IncludeTags { tags: Vec<String> },
    RemoveIncludeTags { tags: Vec<String> },
    ExcludeEntityIds { entity_ids: Vec<String> },
    RemoveExcludeEntityIds { entity_ids: Vec<String> },
    IncludeEntityIds { entity_offsets: Vec<EntityIdOffset> },
    RemoveIncludeEntityIds { entity_ids: Vec<String> },
    ExcludeRegexEntityIds { matching: Vec<String> },
    RemoveExcludeRegexEntityIds { matching: Vec<String> },
    IncludeRegexEntityIds { matching: Vec<String> },
    RemoveIncludeRegexEntityIds { matching: Vec<String> },
}

/// Outcome of evaluating one envelope against the current filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Emit the full event.
    Emit,
    /// Suppress the payload; emit a filtered placeholder instead.
    Filter,
}

/// Materialized filter state for one stream.
#[derive(Debug, Default, Clone)]
pub struct FilterState {
    exclude_tags: BTreeSet<String>,
    include_tags: BTreeSet<String>,
    exclude_entity_ids: BTreeSet<String>,
    /// Included entity ids with their replay floor (0 = none).
    include_entity_ids: BTreeMap<String, i64>,
    exclude_regex: BTreeMap<String, Regex>,
    include_regex: BTreeMap<String, Regex>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of active criteria entries.
    pub fn criteria_count(&self) -> usize {
        self.exclude_tags.len()
            + self.include_tags.len()
            + self.exclude_entity_ids.len()
            + self.include_entity_ids.len()
            + self.exclude_regex.len()
            + self.include_regex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria_count() == 0
    }

    /// Apply a batch of criteria mutations.
    ///
    /// Returns the entity offsets with a replay floor (`seq_nr > 0`) that
    /// were added by this batch, so the caller can trigger targeted replay.
    /// Fails with a protocol error on an invalid regex or when the result
    /// would exceed `max_criteria`; the state is left unchanged on failure.
    pub fn apply(
        &mut self,
        criteria: &[FilterCriteria],
        max_criteria: usize,
    ) -> Result<Vec<EntityIdOffset>> {
        let mut next = self.clone();
        let mut replay = Vec::new();

        for criterion in criteria {
            match criterion {
                FilterCriteria::ExcludeTags { tags } => {
                    next.exclude_tags.extend(tags.iter().cloned());
                }
                FilterCriteria::RemoveExcludeTags { tags } => {
                    for tag in tags {
                        next.exclude_tags.remove(tag);
                    }
                }
                FilterCriteria::IncludeTags { tags } => {
                    next.include_tags.extend(tags.iter().cloned());
                }
                FilterCriteria::RemoveIncludeTags { tags } => {
                    for tag in tags {
                        next.include_tags.remove(tag);
                    }
                }
                FilterCriteria::ExcludeEntityIds { entity_ids } => {
                    next.exclude_entity_ids.extend(entity_ids.iter().cloned());
                }
                FilterCriteria::RemoveExcludeEntityIds { entity_ids } => {
                    for id in entity_ids {
                        next.exclude_entity_ids.remove(id);
                    }
                }
                FilterCriteria::IncludeEntityIds { entity_offsets } => {
                    for eo in entity_offsets {
                        next.include_entity_ids
                            .insert(eo.entity_id.clone(), eo.seq_nr);
                        if eo.seq_nr > 0 {
                            replay.push(eo.clone());
                        }
                    }
                }
                FilterCriteria::RemoveIncludeEntityIds { entity_ids } => {
                    for id in entity_ids {
                        next.include_entity_ids.remove(id);
                    }
                }
                FilterCriteria::ExcludeRegexEntityIds { matching } => {
                    for pattern in matching {
                        if !next.exclude_regex.contains_key(pattern) {
                            let re = compile(pattern)?;
                            next.exclude_regex.insert(pattern.clone(), re);
                        }
                    }
                }
                FilterCriteria::RemoveExcludeRegexEntityIds { matching } => {
                    for pattern in matching {
                        next.exclude_regex.remove(pattern);
                    }
                }
                FilterCriteria::IncludeRegexEntityIds { matching } => {
                    for pattern in matching {
                        if !next.include_regex.contains_key(pattern) {
                            let re = compile(pattern)?;
                            next.include_regex.insert(pattern.clone(), re);
                        }
                    }
                }
                FilterCriteria::RemoveIncludeRegexEntityIds { matching } => {
                    for pattern in matching {
                        next.include_regex.remove(pattern);
                    }
                }
            }
        }

        if next.criteria_count() > max_criteria {
            return Err(ReplicationError::Protocol(format!(
                "filter criteria limit exceeded: {} > {}",
                next.criteria_count(),
                max_criteria
            )));
        }

        *self = next;
        Ok(replay)
    }

    /// Evaluate an envelope against the current state.
    pub fn eval(&self, envelope: &EventEnvelope) -> FilterDecision {
        if !self.matches_exclude(envelope) {
            return FilterDecision::Emit;
        }
        if self.matches_include(envelope) {
            FilterDecision::Emit
        } else {
            FilterDecision::Filter
        }
    }

    fn matches_exclude(&self, envelope: &EventEnvelope) -> bool {
        envelope.tags.iter().any(|t| self.exclude_tags.contains(t))
            || self.exclude_entity_ids.contains(&envelope.persistence_id)
            || self
                .exclude_regex
                .values()
                .any(|re| re.is_match(&envelope.persistence_id))
    }

    fn matches_include(&self, envelope: &EventEnvelope) -> bool {
        envelope.tags.iter().any(|t| self.include_tags.contains(t))
            || self
                .include_entity_ids
                .contains_key(&envelope.persistence_id)
            || self
                .include_regex
                .values()
                .any(|re| re.is_match(&envelope.persistence_id))
    }

    /// Render the current state as a batch of add criteria.
    ///
    /// Applying the result to an empty state reproduces this state; used to
    /// re-establish the filter on reconnect.
    pub fn to_criteria(&self) -> Vec<FilterCriteria> {
        let mut out = Vec::new();
        if !self.exclude_tags.is_empty() {
            out.push(FilterCriteria::ExcludeTags {
                tags: self.exclude_tags.iter().cloned().collect(),
            });
        }
        if !self.include_tags.is_empty() {
            out.push(FilterCriteria::IncludeTags {
                tags: self.include_tags.iter().cloned().collect(),
            });
        }
        if !self.exclude_entity_ids.is_empty() {
            out.push(FilterCriteria::ExcludeEntityIds {
                entity_ids: self.exclude_entity_ids.iter().cloned().collect(),
            });
        }
        if !self.include_entity_ids.is_empty() {
            out.push(FilterCriteria::IncludeEntityIds {
                entity_offsets: self
                    .include_entity_ids
                    .iter()
                    .map(|(id, floor)| EntityIdOffset::new(id.clone(), *floor))
                    .collect(),
            });
        }
        if !self.exclude_regex.is_empty() {
            out.push(FilterCriteria::ExcludeRegexEntityIds {
                matching: self.exclude_regex.keys().cloned().collect(),
            });
        }
        if !self.include_regex.is_empty() {
            out.push(FilterCriteria::IncludeRegexEntityIds {
                matching: self.include_regex.keys().cloned().collect(),
            });
        }
        out
    }

    /// Compute the mutations that turn this state into `target`.
    ///
    /// Used by the consumer to forward registry changes mid-stream without
    /// tearing the connection down: removes first, then adds.
    pub fn diff(&self, target: &FilterState) -> Vec<FilterCriteria> {
        let mut out = Vec::new();

        let removed_tags: Vec<String> = self
            .exclude_tags
            .difference(&target.exclude_tags)
            .cloned()
            .collect();
        if !removed_tags.is_empty() {
            out.push(FilterCriteria::RemoveExcludeTags { tags: removed_tags });
        }
        let removed_tags: Vec<String> = self
            .include_tags
            .difference(&target.include_tags)
            .cloned()
            .collect();
        if !removed_tags.is_empty() {
            out.push(FilterCriteria::RemoveIncludeTags { tags: removed_tags });
        }
        let removed_ids: Vec<String> = self
            .exclude_entity_ids
            .difference(&target.exclude_entity_ids)
            .cloned()
            .collect();
        if !removed_ids.is_empty() {
            out.push(FilterCriteria::RemoveExcludeEntityIds {
                entity_ids: removed_ids,
            });
        }
        let removed_ids: Vec<String> = self
            .include_entity_ids
            .keys()
            .filter(|id| !target.include_entity_ids.contains_key(*id))
            .cloned()
            .collect();
        if !removed_ids.is_empty() {
            out.push(FilterCriteria::RemoveIncludeEntityIds {
                entity_ids: removed_ids,
            });
        }
        let removed: Vec<String> = self
            .exclude_regex
            .keys()
            .filter(|p| !target.exclude_regex.contains_key(*p))
            .cloned()
            .collect();
        if !removed.is_empty() {
            out.push(FilterCriteria::RemoveExcludeRegexEntityIds { matching: removed });
        }
        let removed: Vec<String> = self
            .include_regex
            .keys()
            .filter(|p| !target.include_regex.contains_key(*p))
            .cloned()
            .collect();
        if !removed.is_empty() {
            out.push(FilterCriteria::RemoveIncludeRegexEntityIds { matching: removed });
        }

        let added_tags: Vec<String> = target
            .exclude_tags
            .difference(&self.exclude_tags)
            .cloned()
            .collect();
        if !added_tags.is_empty() {
            out.push(FilterCriteria::ExcludeTags { tags: added_tags });
        }
        let added_tags: Vec<String> = target
            .include_tags
            .difference(&self.include_tags)
            .cloned()
            .collect();
        if !added_tags.is_empty() {
            out.push(FilterCriteria::IncludeTags { tags: added_tags });
        }
        let added_ids: Vec<String> = target
            .exclude_entity_ids
            .difference(&self.exclude_entity_ids)
            .cloned()
            .collect();
        if !added_ids.is_empty() {
            out.push(FilterCriteria::ExcludeEntityIds {
                entity_ids: added_ids,
            });
        }
        let added_offsets: Vec<EntityIdOffset> = target
            .include_entity_ids
            .iter()
            .filter(|(id, floor)| self.include_entity_ids.get(*id) != Some(floor))
            .map(|(id, floor)| EntityIdOffset::new(id.clone(), *floor))
            .collect();
        if !added_offsets.is_empty() {
            out.push(FilterCriteria::IncludeEntityIds {
                entity_offsets: added_offsets,
            });
        }
        let added: Vec<String> = target
            .exclude_regex
            .keys()
            .filter(|p| !self.exclude_regex.contains_key(*p))
            .cloned()
            .collect();
        if !added.is_empty() {
            out.push(FilterCriteria::ExcludeRegexEntityIds { matching: added });
        }
        let added: Vec<String> = target
            .include_regex
            .keys()
            .filter(|p| !self.include_regex.contains_key(*p))
            .cloned()
            .collect();
        if !added.is_empty() {
            out.push(FilterCriteria::IncludeRegexEntityIds { matching: added });
        }

        out
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ReplicationError::Protocol(format!("invalid filter regex {:?}: {}", pattern, e)))
}

/// Consumer-side registry of filter criteria, keyed by stream id.
///
/// Any part of the consumer service may update the filter; every worker
/// subscribed to the same stream id observes the change and forwards it to
/// its producer. In a clustered deployment the embedding runtime replicates
/// updates between nodes and feeds them through this same API; a single
/// node collapses to this in-memory map.
pub struct ConsumerFilterRegistry {
    max_criteria: usize,
    streams: Mutex<HashMap<String, watch::Sender<Vec<FilterCriteria>>>>,
}

impl ConsumerFilterRegistry {
    pub fn new(max_criteria: usize) -> Self {
        Self {
            max_criteria,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Apply criteria mutations for a stream and notify subscribers with
    /// the new canonical snapshot.
    pub fn update(&self, stream_id: &str, criteria: Vec<FilterCriteria>) -> Result<()> {
        let mut streams = self.streams.lock().expect("filter registry poisoned");
        let sender = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0);

        let mut state = FilterState::new();
        state.apply(&sender.borrow(), usize::MAX)?;
        state.apply(&criteria, self.max_criteria)?;
        let snapshot = state.to_criteria();
        let _ = sender.send(snapshot);
        Ok(())
    }

    /// Current canonical criteria snapshot for a stream.
    pub fn snapshot(&self, stream_id: &str) -> Vec<FilterCriteria> {
        let streams = self.streams.lock().expect("filter registry poisoned");
        streams
            .get(stream_id)
            .map(|s| s.borrow().clone())
            .unwrap_or_default()
    }

    /// Subscribe to snapshot changes for a stream.
    pub fn subscribe(&self, stream_id: &str) -> watch::Receiver<Vec<FilterCriteria>> {
        let mut streams = self.streams.lock().expect("filter registry poisoned");
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }
}

impl Default for ConsumerFilterRegistry {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FILTER_CRITERIA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use chrono::{TimeZone, Utc};

    fn envelope(pid: &str, tags: &[&str]) -> EventEnvelope {
        EventEnvelope::new(pid, 1, Utc.timestamp_micros(1).unwrap(), None)
            .with_tags(tags.iter().copied())
    }

    #[test]
    fn test_empty_filter_emits_everything() {
        let state = FilterState::new();
        assert_eq!(state.eval(&envelope("a", &["small"])), FilterDecision::Emit);
    }

    #[test]
    fn test_exclude_tag_filters() {
        let mut state = FilterState::new();
        state
            .apply(
                &[FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                }],
                256,
            )
            .unwrap();

        assert_eq!(
            state.eval(&envelope("a", &["small"])),
            FilterDecision::Filter
        );
        assert_eq!(state.eval(&envelope("a", &["large"])), FilterDecision::Emit);
        assert_eq!(state.eval(&envelope("a", &[])), FilterDecision::Emit);
    }

    #[test]
    fn test_include_tag_overrides_exclude() {
        // Scenario: exclude "small", include "large"; an event tagged with
        // both is excluded then re-included.
        let mut state = FilterState::new();
        state
            .apply(
                &[
                    FilterCriteria::ExcludeTags {
                        tags: vec!["small".into()],
                    },
                    FilterCriteria::IncludeTags {
                        tags: vec!["large".into()],
                    },
                ],
                256,
            )
            .unwrap();

        assert_eq!(
            state.eval(&envelope("a", &["small", "large"])),
            FilterDecision::Emit
        );
        assert_eq!(
            state.eval(&envelope("a", &["small"])),
            FilterDecision::Filter
        );
        // Include alone never suppresses.
        assert_eq!(state.eval(&envelope("a", &["large"])), FilterDecision::Emit);
    }

    #[test]
    fn test_exclude_entity_id_and_reinclude() {
        let mut state = FilterState::new();
        state
            .apply(
                &[
                    FilterCriteria::ExcludeRegexEntityIds {
                        matching: vec!["^cart-.*".into()],
                    },
                    FilterCriteria::IncludeEntityIds {
                        entity_offsets: vec![EntityIdOffset::new("cart-7", 0)],
                    },
                ],
                256,
            )
            .unwrap();

        assert_eq!(state.eval(&envelope("cart-1", &[])), FilterDecision::Filter);
        assert_eq!(state.eval(&envelope("cart-7", &[])), FilterDecision::Emit);
        assert_eq!(state.eval(&envelope("order-1", &[])), FilterDecision::Emit);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let criteria = vec![
            FilterCriteria::ExcludeTags {
                tags: vec!["small".into()],
            },
            FilterCriteria::ExcludeEntityIds {
                entity_ids: vec!["a".into(), "b".into()],
            },
        ];

        let mut once = FilterState::new();
        once.apply(&criteria, 256).unwrap();
        let mut twice = FilterState::new();
        twice.apply(&criteria, 256).unwrap();
        twice.apply(&criteria, 256).unwrap();

        assert_eq!(once.criteria_count(), twice.criteria_count());
        assert_eq!(once.to_criteria(), twice.to_criteria());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut state = FilterState::new();
        state
            .apply(
                &[FilterCriteria::RemoveExcludeTags {
                    tags: vec!["never-added".into()],
                }],
                256,
            )
            .unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_remove_undoes_add() {
        let mut state = FilterState::new();
        state
            .apply(
                &[FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                }],
                256,
            )
            .unwrap();
        state
            .apply(
                &[FilterCriteria::RemoveExcludeTags {
                    tags: vec!["small".into()],
                }],
                256,
            )
            .unwrap();
        assert!(state.is_empty());
        assert_eq!(
            state.eval(&envelope("a", &["small"])),
            FilterDecision::Emit
        );
    }

    #[test]
    fn test_apply_returns_replay_floors() {
        let mut state = FilterState::new();
        let replay = state
            .apply(
                &[FilterCriteria::IncludeEntityIds {
                    entity_offsets: vec![
                        EntityIdOffset::new("cart-1", 5),
                        EntityIdOffset::new("cart-2", 0),
                    ],
                }],
                256,
            )
            .unwrap();
        assert_eq!(replay, vec![EntityIdOffset::new("cart-1", 5)]);
    }

    #[test]
    fn test_invalid_regex_rejected_state_unchanged() {
        let mut state = FilterState::new();
        state
            .apply(
                &[FilterCriteria::ExcludeTags {
                    tags: vec!["keep".into()],
                }],
                256,
            )
            .unwrap();

        let err = state
            .apply(
                &[FilterCriteria::ExcludeRegexEntityIds {
                    matching: vec!["(unclosed".into()],
                }],
                256,
            )
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(state.criteria_count(), 1);
    }

    #[test]
    fn test_criteria_cap_enforced_atomically() {
        let mut state = FilterState::new();
        let ids: Vec<String> = (0..4).map(|i| format!("id-{}", i)).collect();
        state
            .apply(&[FilterCriteria::ExcludeEntityIds { entity_ids: ids }], 4)
            .unwrap();
        assert_eq!(state.criteria_count(), 4);

        let err = state
            .apply(
                &[FilterCriteria::ExcludeEntityIds {
                    entity_ids: vec!["one-too-many".into()],
                }],
                4,
            )
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
        // Prior state intact.
        assert_eq!(state.criteria_count(), 4);
        assert_eq!(
            state.eval(&envelope("one-too-many", &[])),
            FilterDecision::Emit
        );
    }

    #[test]
    fn test_to_criteria_roundtrip() {
        let mut state = FilterState::new();
        state
            .apply(
                &[
                    FilterCriteria::ExcludeTags {
                        tags: vec!["small".into()],
                    },
                    FilterCriteria::IncludeEntityIds {
                        entity_offsets: vec![EntityIdOffset::new("cart-7", 3)],
                    },
                    FilterCriteria::IncludeRegexEntityIds {
                        matching: vec!["^vip-.*".into()],
                    },
                ],
                256,
            )
            .unwrap();

        let mut rebuilt = FilterState::new();
        rebuilt.apply(&state.to_criteria(), 256).unwrap();
        assert_eq!(rebuilt.to_criteria(), state.to_criteria());
        assert_eq!(rebuilt.criteria_count(), state.criteria_count());
    }

    #[test]
    fn test_diff_produces_removes_and_adds() {
        let mut old = FilterState::new();
        old.apply(
            &[
                FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                },
                FilterCriteria::ExcludeEntityIds {
                    entity_ids: vec!["gone".into()],
                },
            ],
            256,
        )
        .unwrap();

        let mut new = FilterState::new();
        new.apply(
            &[
                FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                },
                FilterCriteria::IncludeTags {
                    tags: vec!["large".into()],
                },
            ],
            256,
        )
        .unwrap();

        let diff = old.diff(&new);
        let mut patched = old.clone();
        patched.apply(&diff, 256).unwrap();
        assert_eq!(patched.to_criteria(), new.to_criteria());

        assert!(diff.contains(&FilterCriteria::RemoveExcludeEntityIds {
            entity_ids: vec!["gone".into()]
        }));
        assert!(diff.contains(&FilterCriteria::IncludeTags {
            tags: vec!["large".into()]
        }));
    }

    #[test]
    fn test_registry_update_and_snapshot() {
        let registry = ConsumerFilterRegistry::new(256);
        assert!(registry.snapshot("cart").is_empty());

        registry
            .update(
                "cart",
                vec![FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                }],
            )
            .unwrap();

        let snapshot = registry.snapshot("cart");
        assert_eq!(
            snapshot,
            vec![FilterCriteria::ExcludeTags {
                tags: vec!["small".into()]
            }]
        );

        // Incremental update accumulates; other streams are untouched.
        registry
            .update(
                "cart",
                vec![FilterCriteria::IncludeTags {
                    tags: vec!["large".into()],
                }],
            )
            .unwrap();
        assert_eq!(registry.snapshot("cart").len(), 2);
        assert!(registry.snapshot("order").is_empty());
    }

    #[tokio::test]
    async fn test_registry_subscribers_see_updates() {
        let registry = ConsumerFilterRegistry::new(256);
        let mut rx = registry.subscribe("cart");

        registry
            .update(
                "cart",
                vec![FilterCriteria::ExcludeTags {
                    tags: vec!["small".into()],
                }],
            )
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }
}
