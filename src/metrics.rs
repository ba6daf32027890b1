//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Producer stream lifecycle and emissions
//! - Filtering and replay activity
//! - Journal read performance
//! - Offset persistence
//! - Projection restarts and daemon rebalances
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a replication stream opening on the producer.
pub fn record_stream_started(stream_id: &str) {
    counter!("replication_streams_started_total", "stream_id" => stream_id.to_string()).increment(1);
    gauge!("replication_streams_active", "stream_id" => stream_id.to_string()).increment(1.0);
}

/// Record a replication stream closing on the producer.
pub fn record_stream_closed(stream_id: &str) {
    gauge!("replication_streams_active", "stream_id" => stream_id.to_string()).decrement(1.0);
}

/// Record full events emitted to a consumer.
pub fn record_events_emitted(stream_id: &str, count: usize) {
    counter!("replication_events_emitted_total", "stream_id" => stream_id.to_string())
        .increment(count as u64);
}

/// Record filtered placeholders emitted to a consumer.
pub fn record_events_filtered(stream_id: &str, count: usize) {
    counter!("replication_events_filtered_total", "stream_id" => stream_id.to_string())
        .increment(count as u64);
}

/// Record events suppressed by the static producer filter (never emitted).
pub fn record_producer_suppressed(stream_id: &str) {
    counter!("replication_producer_suppressed_total", "stream_id" => stream_id.to_string())
        .increment(1);
}

/// Record a backtracking redelivery skipped by the stream engine.
pub fn record_backtracking_skipped(stream_id: &str) {
    counter!("replication_backtracking_skipped_total", "stream_id" => stream_id.to_string())
        .increment(1);
}

/// Record a filter mutation applied to a stream.
pub fn record_filter_update(stream_id: &str, criteria: usize) {
    counter!("replication_filter_updates_total", "stream_id" => stream_id.to_string()).increment(1);
    gauge!("replication_filter_criteria", "stream_id" => stream_id.to_string())
        .set(criteria as f64);
}

/// Record entities queued for targeted replay.
pub fn record_replay_requested(stream_id: &str, entities: usize) {
    counter!("replication_replay_requests_total", "stream_id" => stream_id.to_string())
        .increment(entities as u64);
}

/// Record envelopes re-emitted by replay.
pub fn record_replayed_events(stream_id: &str, count: usize) {
    counter!("replication_replayed_events_total", "stream_id" => stream_id.to_string())
        .increment(count as u64);
}

/// Record envelopes read from the journal.
pub fn record_journal_events_read(entity_type: &str, count: usize) {
    counter!("replication_journal_events_read_total", "entity_type" => entity_type.to_string())
        .increment(count as u64);
}

/// Record a retried journal read.
pub fn record_journal_read_retry(entity_type: &str) {
    counter!("replication_journal_read_retries_total", "entity_type" => entity_type.to_string())
        .increment(1);
}

/// Record an offset save.
pub fn record_offset_saved(projection_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_offset_saves_total", "projection_id" => projection_id.to_string(), "status" => status)
        .increment(1);
}

/// Record offset save latency.
pub fn record_offset_save_latency(projection_id: &str, duration: Duration) {
    histogram!("replication_offset_save_duration_seconds", "projection_id" => projection_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record envelopes handled by a projection.
pub fn record_envelopes_processed(projection_id: &str, count: usize) {
    counter!("replication_envelopes_processed_total", "projection_id" => projection_id.to_string())
        .increment(count as u64);
}

/// Record a projection restart after a failure.
pub fn record_projection_restart(projection_id: &str) {
    counter!("replication_projection_restarts_total", "projection_id" => projection_id.to_string())
        .increment(1);
}

/// Record a consumer transport reconnect attempt.
pub fn record_reconnect(stream_id: &str) {
    counter!("replication_reconnects_total", "stream_id" => stream_id.to_string()).increment(1);
}

/// Record daemon worker count after a rebalance.
pub fn set_daemon_workers(daemon: &str, count: usize) {
    gauge!("replication_daemon_workers", "daemon" => daemon.to_string()).set(count as f64);
}

/// Record a daemon rebalance.
pub fn record_daemon_rebalance(daemon: &str) {
    counter!("replication_daemon_rebalances_total", "daemon" => daemon.to_string()).increment(1);
}
