//! Configuration for the replication engine.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"500ms"`, `"5s"`); key names
//! follow the recognized config keys of the replication protocol
//! (`stream-id`, `behind-current-time`, `restart-backoff.{min,max,factor}`,
//! `saveOffset-afterEnvelopes`, `saveOffset-afterDuration`,
//! `replay.parallelism`).
//!
//! # Quick Start
//!
//! ```rust
//! use event_replication::config::{ConsumerConfig, ProducerConfig};
//!
//! let producer = ProducerConfig::default();
//! let consumer = ConsumerConfig {
//!     stream_id: "cart".into(),
//!     ..Default::default()
//! };
//! assert_eq!(producer.page_size, 100);
//! assert_eq!(consumer.stream_id, "cart");
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::RestartBackoff;

/// Upper bound on active filter criteria per stream.
pub const DEFAULT_MAX_FILTER_CRITERIA: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// ProducerConfig: sliced source and stream engine settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer-side settings: sliced source pacing and per-stream limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Tail lag window: events younger than this are withheld during live
    /// tailing to tolerate in-flight inserts with lower but later-committed
    /// timestamps.
    #[serde(rename = "behind-current-time", default = "default_behind_current_time")]
    pub behind_current_time: String,

    /// How often the source polls the journal while tailed up.
    #[serde(rename = "poll-interval", default = "default_poll_interval")]
    pub poll_interval: String,

    /// Journal read page size, and the bound on how far the producer may
    /// buffer ahead of consumer demand.
    #[serde(rename = "page-size", default = "default_page_size")]
    pub page_size: usize,

    /// Maximum active filter criteria per stream.
    #[serde(rename = "max-filter-criteria", default = "default_max_filter_criteria")]
    pub max_filter_criteria: usize,

    /// Replay settings.
    #[serde(default)]
    pub replay: ReplayConfig,
}

fn default_behind_current_time() -> String {
    "500ms".to_string()
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_filter_criteria() -> usize {
    DEFAULT_MAX_FILTER_CRITERIA
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            behind_current_time: default_behind_current_time(),
            poll_interval: default_poll_interval(),
            page_size: default_page_size(),
            max_filter_criteria: default_max_filter_criteria(),
            replay: ReplayConfig::default(),
        }
    }
}

impl ProducerConfig {
    /// Parse `behind-current-time` to a Duration.
    pub fn behind_current_time_duration(&self) -> Duration {
        humantime::parse_duration(&self.behind_current_time)
            .unwrap_or(Duration::from_millis(500))
    }

    /// Parse `poll-interval` to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(100))
    }

    /// Fast settings for tests: no tail lag, tight polling.
    pub fn for_testing() -> Self {
        Self {
            behind_current_time: "0s".to_string(),
            poll_interval: "5ms".to_string(),
            page_size: 10,
            ..Default::default()
        }
    }
}

/// Targeted replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Concurrent entity replays per stream; excess requests queue.
    #[serde(default = "default_replay_parallelism")]
    pub parallelism: usize,
}

fn default_replay_parallelism() -> usize {
    4
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            parallelism: default_replay_parallelism(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: projection and offset commit settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer-side settings: stream selection, restart schedule, offset
/// batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Default stream id used when the projection does not override it.
    #[serde(rename = "stream-id", default)]
    pub stream_id: String,

    /// Restart schedule after stream or handler failure. Also paces
    /// transport reconnects.
    #[serde(rename = "restart-backoff", default)]
    pub restart_backoff: RestartBackoffConfig,

    /// At-least-once mode: commit the offset after this many envelopes...
    #[serde(rename = "saveOffset-afterEnvelopes", default = "default_after_envelopes")]
    pub save_offset_after_envelopes: usize,

    /// ...or after this much time since the first uncommitted envelope,
    /// whichever comes first.
    #[serde(rename = "saveOffset-afterDuration", default = "default_after_duration")]
    pub save_offset_after_duration: String,
}

fn default_after_envelopes() -> usize {
    10
}

fn default_after_duration() -> String {
    "1s".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_id: String::new(),
            restart_backoff: RestartBackoffConfig::default(),
            save_offset_after_envelopes: default_after_envelopes(),
            save_offset_after_duration: default_after_duration(),
        }
    }
}

impl ConsumerConfig {
    /// Parse `saveOffset-afterDuration` to a Duration.
    pub fn save_offset_after_duration_duration(&self) -> Duration {
        humantime::parse_duration(&self.save_offset_after_duration)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Fast settings for tests: eager commits, snappy restarts.
    pub fn for_testing(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            restart_backoff: RestartBackoffConfig::for_testing(),
            save_offset_after_envelopes: 1,
            save_offset_after_duration: "10ms".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RestartBackoffConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Exponential backoff schedule for projection restarts and reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartBackoffConfig {
    #[serde(default = "default_backoff_min")]
    pub min: String,
    #[serde(default = "default_backoff_max")]
    pub max: String,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_backoff_min() -> String {
    "200ms".to_string()
}

fn default_backoff_max() -> String {
    "5s".to_string()
}

fn default_backoff_factor() -> f64 {
    1.1
}

impl Default for RestartBackoffConfig {
    fn default() -> Self {
        Self {
            min: default_backoff_min(),
            max: default_backoff_max(),
            factor: default_backoff_factor(),
        }
    }
}

impl RestartBackoffConfig {
    /// Build the runtime backoff schedule.
    pub fn to_backoff(&self) -> RestartBackoff {
        RestartBackoff::new(
            humantime::parse_duration(&self.min).unwrap_or(Duration::from_millis(200)),
            humantime::parse_duration(&self.max).unwrap_or(Duration::from_secs(5)),
            self.factor,
        )
    }

    /// Near-instant restarts for tests.
    pub fn for_testing() -> Self {
        Self {
            min: "1ms".to_string(),
            max: "10ms".to_string(),
            factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OffsetStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Offset persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetStoreConfig {
    /// Path to the SQLite database holding offset rows.
    #[serde(rename = "sqlite-path")]
    pub sqlite_path: String,
}

impl Default for OffsetStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "projection_offsets.db".to_string(),
        }
    }
}

impl OffsetStoreConfig {
    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
