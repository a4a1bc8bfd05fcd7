//! Publication pipeline.
//!
//! Measurement batches arrive from the routing layer and leave as data
//! packets: per-measurement compact serialization bounded by the maximum
//! packet size, or stateful streaming blocks when payload compression is
//! negotiated. Throttled subscriptions divert arrivals into the
//! latest-value map; the publication timer drains it. Neither path raises
//! outward: unresolvable signals are dropped and codec pressure flushes
//! early.

use std::sync::atomic::Ordering;

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use gridpulse_wire::commands::{data_packet_flags, server_command, server_response};
use gridpulse_wire::measurement::Measurement;
use gridpulse_wire::{ticks, CompactMeasurement, MAX_PACKET_SIZE};

use crate::transport::session::{SubscriberSession, TsscState};

/// Version byte carried by every compressed data packet.
const COMPRESSED_PACKET_VERSION: u8 = 85;

/// Entry point for a batch of measurements routed to this subscriber.
pub(crate) fn publish_measurements(session: &SubscriberSession, measurements: &[Measurement]) {
    if measurements.is_empty() || !session.is_subscribed() {
        return;
    }

    if !session.start_time_sent.load(Ordering::SeqCst)
        && send_data_start_time(session, measurements[0].timestamp)
    {
        session.start_time_sent.store(true, Ordering::SeqCst);
    }

    let track_latest = session
        .params
        .lock()
        .expect("params lock")
        .track_latest_measurements;

    if track_latest {
        let mut latest = session
            .latest_measurements
            .lock()
            .expect("latest measurements lock");
        for measurement in measurements {
            latest.insert(measurement.signal_id, *measurement);
        }
    } else if session.using_payload_compression.load(Ordering::SeqCst) {
        publish_tssc_measurements(session, measurements);
    } else {
        publish_compact_measurements(session, measurements);
    }
}

fn send_data_start_time(session: &SubscriberSession, timestamp: i64) -> bool {
    let sent = session.send_response(
        server_response::DATA_START_TIME,
        server_command::SUBSCRIBE,
        &(timestamp as u64).to_be_bytes(),
    );
    if sent {
        tracing::info!(connection = %session.connection_id(), "start time sent to subscriber");
    }
    sent
}

pub(crate) fn publish_compact_measurements(
    session: &SubscriberSession,
    measurements: &[Measurement],
) {
    let Some((cache, cache_index)) = session.current_cache_with_index() else {
        return;
    };
    if cache.is_empty() {
        return;
    }

    let (include_time, use_millisecond_resolution, is_nan_filtered, snapshot) = {
        let params = session.params.lock().expect("params lock");
        (
            params.include_time,
            params.use_millisecond_resolution,
            params.is_nan_filtered,
            (
                params.use_local_clock_as_real_time,
                params.enable_time_reasonability_check,
                params.lag_time,
                params.lead_time,
            ),
        )
    };
    let (use_local_clock, reasonability_check, lag_time, lead_time) = snapshot;
    let temporal = session.is_temporal_subscription();

    let (offsets, time_index) = {
        let base_times = session.base_times.lock().expect("base time lock");
        (base_times.offsets, base_times.time_index)
    };
    let serializer = CompactMeasurement::new(
        offsets,
        include_time,
        use_millisecond_resolution,
        time_index,
    );

    let mut packet = BytesMut::with_capacity(MAX_PACKET_SIZE);
    let mut buffer = BytesMut::with_capacity(serializer.max_length());
    let mut count: i32 = 0;

    for measurement in measurements {
        let runtime_id = cache.runtime_id(&measurement.signal_id);
        if runtime_id == -1 {
            continue;
        }
        if is_nan_filtered && measurement.value.is_nan() {
            continue;
        }

        buffer.clear();
        let length = serializer.serialize(measurement, runtime_id, &mut buffer);

        if packet.len() + length > MAX_PACKET_SIZE {
            publish_compact_packet(session, &packet, count, cache_index);
            packet.clear();
            count = 0;
        }
        packet.extend_from_slice(&buffer);
        count += 1;

        // Track the newest reasonable timestamp for base-time rotation.
        let timestamp = measurement.timestamp;
        if !use_local_clock
            && (!reasonability_check
                || ticks::timestamp_is_reasonable(timestamp, lag_time, lead_time)
                || temporal)
        {
            session
                .latest_timestamp
                .fetch_max(timestamp & ticks::VALUE_MASK, Ordering::SeqCst);
        }
    }

    if count > 0 {
        publish_compact_packet(session, &packet, count, cache_index);
    }
}

fn publish_compact_packet(session: &SubscriberSession, packet: &[u8], count: i32, cache_index: u8) {
    let mut flags = data_packet_flags::COMPACT;
    if cache_index > 0 {
        flags |= data_packet_flags::CACHE_INDEX;
    }
    let mut buffer = BytesMut::with_capacity(packet.len() + 5);
    buffer.put_u8(flags);
    buffer.put_i32(count);
    buffer.extend_from_slice(packet);

    session.send_response(
        server_response::DATA_PACKET,
        server_command::SUBSCRIBE,
        &buffer,
    );
    record_publication(session, count);
}

pub(crate) fn publish_tssc_measurements(
    session: &SubscriberSession,
    measurements: &[Measurement],
) {
    let Some((cache, cache_index)) = session.current_cache_with_index() else {
        return;
    };
    if cache.is_empty() {
        return;
    }

    // One lock orders codec resets against publication.
    let mut state = session.tssc.lock().expect("tssc lock");
    if state.reset_requested {
        state.reset_requested = false;
        state.encoder.reset();
        if state.sequence != 0 {
            tracing::info!(
                connection = %session.connection_id(),
                sequence = state.sequence,
                "streaming codec reset before sequence number"
            );
        }
        state.sequence = 0;
    }

    state.encoder.begin_block(MAX_PACKET_SIZE);
    let mut count: i32 = 0;

    for measurement in measurements {
        let runtime_id = cache.runtime_id(&measurement.signal_id);
        if runtime_id == -1 {
            continue;
        }

        let added = state.encoder.try_add_measurement(
            runtime_id,
            measurement.timestamp,
            measurement.flags,
            measurement.value as f32,
        );
        if !added {
            publish_tssc_packet(session, &mut state, count, cache_index);
            count = 0;
            state.encoder.begin_block(MAX_PACKET_SIZE);
            state.encoder.try_add_measurement(
                runtime_id,
                measurement.timestamp,
                measurement.flags,
                measurement.value as f32,
            );
        }
        count += 1;
    }

    if count > 0 {
        publish_tssc_packet(session, &mut state, count, cache_index);
    }
}

fn publish_tssc_packet(
    session: &SubscriberSession,
    state: &mut TsscState,
    count: i32,
    cache_index: u8,
) {
    let block = state.encoder.finish_block();

    let mut flags = data_packet_flags::COMPRESSED;
    if cache_index > 0 {
        flags |= data_packet_flags::CACHE_INDEX;
    }
    let mut buffer = BytesMut::with_capacity(block.len() + 8);
    buffer.put_u8(flags);
    buffer.put_i32(count);
    buffer.put_u8(COMPRESSED_PACKET_VERSION);
    buffer.put_u16(state.sequence);
    buffer.extend_from_slice(&block);

    // Sequence zero is reserved for "reset".
    state.sequence = state.sequence.wrapping_add(1);
    if state.sequence == 0 {
        state.sequence = 1;
    }

    session.send_response(
        server_response::DATA_PACKET,
        server_command::SUBSCRIBE,
        &buffer,
    );
    record_publication(session, count);
}

fn record_publication(session: &SubscriberSession, count: i32) {
    *session.last_publish_time.lock().expect("publish time lock") = Some(Utc::now());
    session
        .measurements_sent
        .fetch_add(count as u64, Ordering::SeqCst);
    metrics::counter!("gridpulse_measurements_sent_total").increment(count as u64);
}
