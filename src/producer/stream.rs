//! Per-stream protocol state machine.
//!
//! States: await `Init`, then streaming. While streaming, the task selects
//! between inbound control frames (`Filter`, `Replay`) and the sliced
//! source. Replay work is drained between live emissions, at most
//! `replay.parallelism` entities in flight, each entity ordered by seq_nr.
//!
//! Emission rules, per envelope:
//!
//! 1. Static producer filter rejects: nothing goes out, not even a
//!    placeholder. The suppression is permanent by configuration.
//! 2. Backtracking redeliveries with no payload are skipped. Consumers
//!    repair such entities via `load_event`.
//! 3. Dynamic consumer filter suppresses: a `FilteredEvent` placeholder
//!    preserves `(persistence_id, seq_nr)` continuity.
//! 4. Otherwise the full `Event` goes out, payload bytes verbatim.

use crate::codec;
use crate::envelope::{EventEnvelope, SliceRange, NUMBER_OF_SLICES};
use crate::error::{ReplicationError, Result};
use crate::filter::FilterState;
use crate::metrics;
use crate::producer::{EventProducer, EventProducerSource};
use crate::proto::{stream_in, stream_out, StreamOut};
use crate::source::SlicedEventSource;
use crate::transport::Frame;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// Outcome of pushing one frame to the consumer.
enum Emit {
    Sent,
    /// Producer filter or backtracking skip: nothing went out.
    Suppressed,
    /// Consumer dropped its receiver; the stream is over.
    ConsumerGone,
}

pub(super) async fn run_replication_stream(
    producer: &EventProducer,
    mut inbound: mpsc::Receiver<Frame>,
    outbound: mpsc::Sender<Frame>,
) -> Result<()> {
    // AwaitInit: the first frame decides the stream's fate.
    let first = match inbound.recv().await {
        Some(frame) => frame,
        None => {
            warn!("Replication stream closed before Init");
            return Ok(());
        }
    };
    let init = match codec::decode_stream_in(&first)?.message {
        Some(stream_in::Message::Init(init)) => init,
        other => {
            return Err(ReplicationError::Protocol(format!(
                "first message must be Init, got {:?}",
                other.map(message_kind)
            )))
        }
    };

    let source_config = producer.source_for(&init.stream_id)?.clone();
    let stream_id = source_config.stream_id().to_string();

    if init.slice_min < 0
        || init.slice_min > init.slice_max
        || init.slice_max >= NUMBER_OF_SLICES as i32
    {
        return Err(ReplicationError::Protocol(format!(
            "invalid slice range {}-{}",
            init.slice_min, init.slice_max
        )));
    }
    let slice_range = SliceRange::new(init.slice_min as u32, init.slice_max as u32);

    let offset = init
        .offset
        .as_ref()
        .map(codec::offset_from_proto)
        .transpose()?;

    let config = producer.config();
    let mut filter = FilterState::new();
    let mut replay_queue: VecDeque<(String, i64)> = VecDeque::new();
    let initial_criteria = codec::criteria_from_proto(&init.filter)?;
    for floor in filter.apply(&initial_criteria, config.max_filter_criteria)? {
        replay_queue.push_back((floor.entity_id, floor.seq_nr));
    }

    let span = tracing::info_span!(
        "replication_stream",
        stream_id = %stream_id,
        slice_range = %slice_range
    );

    async move {
        info!(
            entity_type = %source_config.entity_type(),
            from_offset = ?offset.as_ref().map(|o| o.timestamp),
            filter_criteria = filter.criteria_count(),
            "Replication stream initialized"
        );
        metrics::record_stream_started(&stream_id);

        let mut source = SlicedEventSource::new(
            Arc::clone(producer.journal()),
            source_config.entity_type(),
            slice_range,
            offset,
            config.behind_current_time_duration(),
            config.poll_interval_duration(),
            config.page_size,
        );

        let result = streaming_loop(
            producer,
            &source_config,
            &stream_id,
            &mut source,
            &mut filter,
            &mut replay_queue,
            &mut inbound,
            &outbound,
        )
        .await;

        metrics::record_stream_closed(&stream_id);
        match &result {
            Ok(()) => info!("Replication stream closed"),
            Err(e) => warn!(error = %e, "Replication stream failed"),
        }
        result
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn streaming_loop(
    producer: &EventProducer,
    source_config: &EventProducerSource,
    stream_id: &str,
    source: &mut SlicedEventSource,
    filter: &mut FilterState,
    replay_queue: &mut VecDeque<(String, i64)>,
    inbound: &mut mpsc::Receiver<Frame>,
    outbound: &mpsc::Sender<Frame>,
) -> Result<()> {
    let max_criteria = producer.config().max_filter_criteria;
    let parallelism = producer.config().replay.parallelism.max(1);

    loop {
        // Replay work drains between live emissions.
        if !replay_queue.is_empty() {
            if !run_replays(
                producer,
                source_config,
                stream_id,
                filter,
                replay_queue,
                parallelism,
                outbound,
            )
            .await?
            {
                return Ok(());
            }
            continue;
        }

        tokio::select! {
            biased;

            message = inbound.recv() => {
                let Some(frame) = message else {
                    debug!("Consumer closed the stream");
                    return Ok(());
                };
                match codec::decode_stream_in(&frame)?.message {
                    Some(stream_in::Message::Filter(request)) => {
                        let criteria = codec::criteria_from_proto(&request.criteria)?;
                        let floors = filter.apply(&criteria, max_criteria)?;
                        metrics::record_filter_update(stream_id, filter.criteria_count());
                        debug!(
                            criteria = criteria.len(),
                            active = filter.criteria_count(),
                            replay_floors = floors.len(),
                            "Filter updated"
                        );
                        for floor in floors {
                            replay_queue.push_back((floor.entity_id, floor.seq_nr));
                        }
                    }
                    Some(stream_in::Message::Replay(request)) => {
                        metrics::record_replay_requested(stream_id, request.pid_offsets.len());
                        for po in request.pid_offsets {
                            replay_queue.push_back((po.persistence_id, po.seq_nr));
                        }
                    }
                    Some(stream_in::Message::Init(_)) => {
                        return Err(ReplicationError::Protocol(
                            "Init is only valid as the first message".to_string(),
                        ));
                    }
                    None => {
                        return Err(ReplicationError::Protocol(
                            "empty StreamIn message".to_string(),
                        ));
                    }
                }
            }

            envelope = source.next() => {
                match emit_envelope(source_config, stream_id, filter, &envelope?, outbound).await {
                    Emit::ConsumerGone => {
                        debug!("Consumer receiver dropped");
                        return Ok(());
                    }
                    Emit::Sent | Emit::Suppressed => {}
                }
            }
        }
    }
}

/// Drain up to `parallelism` queued entity replays.
///
/// Returns `false` when the consumer is gone.
async fn run_replays(
    producer: &EventProducer,
    source_config: &EventProducerSource,
    stream_id: &str,
    filter: &FilterState,
    replay_queue: &mut VecDeque<(String, i64)>,
    parallelism: usize,
    outbound: &mpsc::Sender<Frame>,
) -> Result<bool> {
    let batch: Vec<(String, i64)> = {
        let take = replay_queue.len().min(parallelism);
        replay_queue.drain(..take).collect()
    };

    let fetches = batch.iter().map(|(pid, floor)| {
        producer
            .journal()
            .events_for_entity(source_config.entity_type(), pid, (*floor).max(1))
    });
    let results = join_all(fetches).await;

    for ((pid, floor), result) in batch.iter().zip(results) {
        let events = result.map_err(|e| {
            ReplicationError::Journal(format!("replay read failed for {}: {}", pid, e))
        })?;
        debug!(
            persistence_id = %pid,
            from_seq_nr = floor,
            count = events.len(),
            "Replaying entity"
        );
        let mut replayed = 0usize;
        for envelope in &events {
            match emit_envelope(source_config, stream_id, filter, envelope, outbound).await {
                Emit::ConsumerGone => return Ok(false),
                Emit::Sent => replayed += 1,
                Emit::Suppressed => {}
            }
        }
        metrics::record_replayed_events(stream_id, replayed);
    }
    Ok(true)
}

async fn emit_envelope(
    source_config: &EventProducerSource,
    stream_id: &str,
    filter: &FilterState,
    envelope: &EventEnvelope,
    outbound: &mpsc::Sender<Frame>,
) -> Emit {
    if !source_config.accepts(envelope) {
        // Permanent suppression: no placeholder, the consumer absorbs the
        // seq_nr gap.
        metrics::record_producer_suppressed(stream_id);
        return Emit::Suppressed;
    }

    if envelope.is_backtracking() && envelope.payload.is_none() {
        debug!(
            persistence_id = %envelope.persistence_id,
            seq_nr = envelope.seq_nr,
            "Skipping backtracking redelivery"
        );
        metrics::record_backtracking_skipped(stream_id);
        return Emit::Suppressed;
    }

    let message = match filter.eval(envelope) {
        crate::filter::FilterDecision::Emit => {
            metrics::record_events_emitted(stream_id, 1);
            StreamOut {
                message: Some(stream_out::Message::Event(codec::event_from_envelope(
                    envelope,
                ))),
            }
        }
        crate::filter::FilterDecision::Filter => {
            metrics::record_events_filtered(stream_id, 1);
            StreamOut {
                message: Some(stream_out::Message::FilteredEvent(
                    codec::filtered_event_from_envelope(envelope),
                )),
            }
        }
    };

    match outbound.send(codec::encode_stream_out(&message)).await {
        Ok(()) => Emit::Sent,
        Err(_) => Emit::ConsumerGone,
    }
}

fn message_kind(message: stream_in::Message) -> &'static str {
    match message {
        stream_in::Message::Init(_) => "Init",
        stream_in::Message::Filter(_) => "Filter",
        stream_in::Message::Replay(_) => "Replay",
    }
}
