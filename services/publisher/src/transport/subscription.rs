//! Subscribe path: connection-string parsing, filter resolution, the
//! signal-index-cache swap protocol, temporal subscription lifecycle, and
//! UDP data-channel setup.
//!
//! Cache swap (version >= 2): the resolver's cache is staged as `next` under
//! the cache lock, tagged with the opposite one-bit index of `current`, and
//! transmitted. Packets keep carrying the current index until the client
//! confirms, at which point `current` and the index swap atomically. A
//! newer subscription arriving mid-handshake replaces the `pending` slot;
//! only the latest pending cache survives.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gridpulse_metadata::parse_measurement_key;
use gridpulse_wire::cache::SignalIndexCache;
use gridpulse_wire::commands::{
    compression_modes, data_packet_flags, operational_modes, server_command, server_response,
};
use gridpulse_wire::settings::{parse_boolean, parse_key_value_pairs};
use gridpulse_wire::ticks;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::publisher::PublisherEvent;
use crate::transport::session::{BaseTimeState, SubscriberSession, SubscriptionParams};
use crate::transport::{timers, writer};

pub(crate) async fn handle_subscribe(session: &Arc<SubscriberSession>, payload: &[u8]) {
    if let Err(err) = try_handle_subscribe(session, payload).await {
        handle_subscribe_failure(
            session,
            &format!("Failed to process client data subscription: {err:#}"),
        );
    }
}

async fn try_handle_subscribe(session: &Arc<SubscriberSession>, payload: &[u8]) -> Result<()> {
    if payload.len() < 5 {
        handle_subscribe_failure(
            session,
            "Not enough buffer was provided to parse client data subscription.",
        );
        return Ok(());
    }

    let flags = payload[0];
    if flags & data_packet_flags::SYNCHRONIZED != 0 {
        handle_subscribe_failure(
            session,
            "Client request for remotely synchronized data subscription was denied. \
             Data publisher currently does not allow for synchronized subscriptions.",
        );
        return Ok(());
    }

    // Stop timers from any prior subscription and clear throttled state.
    session.stop_subscription_timers();
    session
        .latest_measurements
        .lock()
        .expect("latest measurements lock")
        .clear();

    if session.is_subscribed() {
        cancel_temporal_subscription(session);
    }

    let byte_length = u32::from_be_bytes(payload[1..5].try_into().expect("four bytes")) as usize;
    if byte_length == 0 {
        handle_subscribe_failure(
            session,
            "Cannot initialize client data subscription without a connection string.",
        );
        return Ok(());
    }
    if payload.len() < 5 + byte_length {
        handle_subscribe_failure(
            session,
            "Not enough buffer was provided to parse client data subscription.",
        );
        return Ok(());
    }

    let mut modes = session.operational_modes();
    let mut using_payload_compression = modes & operational_modes::COMPRESS_PAYLOAD_DATA != 0
        && modes & compression_modes::TSSC != 0;

    let connection_string = match session.encoding().decode(&payload[5..5 + byte_length]) {
        Ok(value) => value,
        Err(err) => {
            handle_subscribe_failure(
                session,
                &format!("Failed to decode subscription connection string: {err}"),
            );
            return Ok(());
        }
    };

    if !using_payload_compression
        && (flags & data_packet_flags::COMPACT == 0
            || modes & operational_modes::COMPRESS_PAYLOAD_DATA != 0)
    {
        tracing::warn!(
            connection = %session.connection_id(),
            "data packets will be published in compact measurement format only when not \
             compressing payload"
        );
    }

    tracing::info!(
        connection = %session.connection_id(),
        characters = connection_string.chars().count(),
        bytes = byte_length,
        "decoded subscription connection string"
    );

    let settings = parse_key_value_pairs(&connection_string);

    let mut params = SubscriptionParams::default();
    params.is_nan_filtered = session
        .params
        .lock()
        .expect("params lock")
        .is_nan_filtered;

    if let Some(setting) = settings.get("includetime") {
        if let Some(value) = parse_boolean(setting) {
            params.include_time = value;
        }
    }
    if let Some(setting) = settings.get("uselocalclockasrealtime") {
        if let Some(value) = parse_boolean(setting) {
            params.use_local_clock_as_real_time = value;
        }
    }
    if let Some(setting) = settings.get("enabletimereasonabilitycheck") {
        if let Some(value) = parse_boolean(setting) {
            params.enable_time_reasonability_check = value;
        }
    }
    if let Some(setting) = settings.get("lagtime") {
        if let Ok(value) = setting.parse::<f64>() {
            if value > 0.0 {
                params.lag_time = value;
            }
        }
    }
    if let Some(setting) = settings.get("leadtime") {
        if let Ok(value) = setting.parse::<f64>() {
            if value > 0.0 {
                params.lead_time = value;
            }
        }
    }
    if let Some(setting) = settings.get("publishinterval") {
        if let Ok(value) = setting.parse::<f64>() {
            if value > 0.0 {
                params.publish_interval = value;
            }
        }
    }
    if let Some(setting) = settings.get("usemillisecondresolution") {
        if let Some(value) = parse_boolean(setting) {
            params.use_millisecond_resolution = value;
        }
    }
    if let Some(setting) = settings.get("throttled") {
        if let Some(value) = parse_boolean(setting) {
            params.track_latest_measurements = value;
        }
    }

    if let Some(setting) = settings.get("requestnanvaluefilter") {
        if let Some(requested) = parse_boolean(setting) {
            let allowed = session.publisher.is_nan_value_filter_allowed();
            let forced = session.publisher.is_nan_value_filter_forced();
            if requested && !allowed && !forced {
                tracing::warn!(
                    connection = %session.connection_id(),
                    "NaN value filter is disallowed by publisher, request was ignored"
                );
                params.is_nan_filtered = false;
            } else if !requested && forced {
                tracing::warn!(
                    connection = %session.connection_id(),
                    "NaN value filter is required by publisher, request was overridden"
                );
                params.is_nan_filtered = true;
            } else {
                params.is_nan_filtered = requested;
            }
        }
    }

    params.start_time_constraint = settings
        .get("starttimeconstraint")
        .and_then(|setting| ticks::parse_relative_timestamp(setting))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    params.stop_time_constraint = settings
        .get("stoptimeconstraint")
        .and_then(|setting| ticks::parse_relative_timestamp(setting))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    if let Some(setting) = settings.get("processinginterval") {
        if let Ok(value) = setting.parse::<i32>() {
            session.store_processing_interval(value);
        }
    }

    let temporal = params.start_time_constraint < DateTime::<Utc>::MAX_UTC;
    if temporal {
        if !session.publisher.supports_temporal_subscriptions() {
            handle_subscribe_failure(session, "Publisher does not support temporal subscriptions");
            return Ok(());
        }
        if params.start_time_constraint > params.stop_time_constraint {
            handle_subscribe_failure(
                session,
                "Specified stop time of requested temporal subscription precedes start time",
            );
            return Ok(());
        }
        session.temporal_canceled.store(false, Ordering::SeqCst);
    }

    // Parameters must be visible before the cache handshake and first packet.
    *session.params.lock().expect("params lock") = params.clone();

    let filter_expression = settings
        .get("filterexpression")
        .cloned()
        .unwrap_or_default();
    let cache = match parse_subscription_request(session, &filter_expression) {
        Some(cache) => cache,
        None => return Ok(()),
    };

    if let Some(setting) = settings.get("assemblyinfo") {
        session.set_subscription_info(setting);
        tracing::info!(
            connection = %session.connection_id(),
            version = session.version(),
            info = %session.subscription_info(),
            "reported client subscription info"
        );
    }

    if let Some(setting) = settings.get("datachannel") {
        let channel_settings = parse_key_value_pairs(setting);
        let port_setting = channel_settings
            .get("port")
            .or_else(|| channel_settings.get("localport"));
        if let Some(port_setting) = port_setting {
            if using_payload_compression {
                // Stateful compression cannot survive datagram loss.
                tracing::warn!(
                    connection = %session.connection_id(),
                    "cannot use stateful payload compression with UDP, compression disabled"
                );
                using_payload_compression = false;
                modes &= !compression_modes::TSSC;
                modes &= !operational_modes::COMPRESS_PAYLOAD_DATA;
                session.set_operational_modes(modes);
            }
            if let Ok(port) = port_setting.trim().parse::<u16>() {
                setup_data_channel(session, port)
                    .await
                    .context("establish UDP data channel")?;
            }
        }
    }

    session
        .using_payload_compression
        .store(using_payload_compression, Ordering::SeqCst);

    let signal_count = cache.count();
    update_signal_index_cache(session, cache).context("transmit signal index cache")?;

    let subscription_cancel = session.new_subscription_cancel();

    if !using_payload_compression && session.publisher.use_base_time_offsets() && params.include_time
    {
        *session.base_times.lock().expect("base time lock") = BaseTimeState::default();
        session.latest_timestamp.store(0, Ordering::SeqCst);
        let interval_ms: u64 = if params.use_millisecond_resolution {
            60_000
        } else {
            420_000
        };
        timers::spawn_base_time_rotation(
            Arc::clone(session),
            interval_ms,
            subscription_cancel.clone(),
        );
    }

    if params.track_latest_measurements {
        let interval_ms =
            (params.publish_interval.max(params.lag_time).max(1.0) * 1000.0) as u64;
        timers::spawn_throttled_publication(Arc::clone(session), interval_ms, subscription_cancel);
    }

    let message = format!(
        "Client subscribed using {} over {} with {signal_count} signals.",
        if using_payload_compression {
            "TSSC compression"
        } else {
            "compact format"
        },
        if session.is_data_channel_active() {
            "UDP"
        } else {
            "TCP"
        },
    );

    session.subscribed.store(true, Ordering::SeqCst);
    session.send_response_message(server_response::SUCCEEDED, server_command::SUBSCRIBE, &message);
    tracing::info!(connection = %session.connection_id(), "{message}");

    if temporal {
        session
            .publisher
            .dispatch(PublisherEvent::TemporalSubscriptionRequested {
                instance_id: session.instance_id(),
            });
    }
    Ok(())
}

pub(crate) fn handle_subscribe_failure(session: &Arc<SubscriberSession>, message: &str) {
    session.send_response_message(server_response::FAILED, server_command::SUBSCRIBE, message);
    tracing::error!(connection = %session.connection_id(), "{message}");
    if session.is_temporal_subscription() {
        cancel_temporal_subscription(session);
    }
}

/// Fires at most once per temporal subscription: signals processing complete
/// and notifies the publisher.
pub(crate) fn cancel_temporal_subscription(session: &Arc<SubscriberSession>) {
    if session.is_temporal_subscription()
        && !session.temporal_canceled.swap(true, Ordering::SeqCst)
    {
        session.send_response_message(
            server_response::PROCESSING_COMPLETE,
            server_command::SUBSCRIBE,
            &session.publisher.node_id().to_string(),
        );
        session
            .publisher
            .dispatch(PublisherEvent::TemporalSubscriptionCanceled {
                instance_id: session.instance_id(),
            });
    }
}

/// Evaluate the subscriber filter and build a fresh signal index cache with
/// runtime ids assigned in row order. A parse or evaluation failure sends
/// the parser message back and leaves session state untouched.
fn parse_subscription_request(
    session: &Arc<SubscriberSession>,
    filter_expression: &str,
) -> Option<SignalIndexCache> {
    let metadata = session.publisher.metadata();
    match metadata.evaluate_filter(filter_expression) {
        Ok(rows) => {
            let mut cache = SignalIndexCache::new();
            for row in rows {
                let (source, id) = parse_measurement_key(&row.key);
                cache.add_record(row.signal_id, source, id);
            }
            Some(cache)
        }
        Err(err) => {
            let message = format!("Failed to parse subscription filter expression: {err}");
            session.send_response_message(
                server_response::FAILED,
                server_command::SUBSCRIBE,
                &message,
            );
            tracing::error!(connection = %session.connection_id(), "{message}");
            None
        }
    }
}

/// Install or stage a freshly resolved cache.
///
/// Version 1 installs immediately; version 2 and later run the two-slot
/// generation handshake so at most one unacknowledged cache is ever in
/// flight per session.
pub(crate) fn update_signal_index_cache(
    session: &Arc<SubscriberSession>,
    cache: SignalIndexCache,
) -> Result<()> {
    let version = session.version();
    let encoding = session.encoding();
    let modes = session.operational_modes();
    let compress = modes & operational_modes::COMPRESS_SIGNAL_INDEX_CACHE != 0
        && modes & compression_modes::GZIP != 0;

    if version > 1 {
        let staged = {
            let mut caches = session.caches.write().expect("cache lock");
            if caches.next.is_none() {
                caches.next_index = caches.current_index ^ 1;
                let cache = Arc::new(cache.clone());
                caches.next = Some(Arc::clone(&cache));
                Some((cache, caches.next_index))
            } else {
                None
            }
        };
        match staged {
            Some((cache, next_index)) => {
                let mut serialized = cache
                    .serialize(version, encoding, compress)
                    .context("serialize signal index cache")?;
                serialized[0] = next_index;
                session.send_response(
                    server_response::UPDATE_SIGNAL_INDEX_CACHE,
                    server_command::SUBSCRIBE,
                    &serialized,
                );
                session.pending_cache.lock().expect("pending cache lock").take();
            }
            None => {
                // A cache is already awaiting confirmation; coalesce so only
                // the latest pending update survives.
                *session.pending_cache.lock().expect("pending cache lock") = Some(cache);
            }
        }
    } else {
        let cache = Arc::new(cache);
        session.caches.write().expect("cache lock").current = Some(Arc::clone(&cache));
        let serialized = cache
            .serialize(version, encoding, compress)
            .context("serialize signal index cache")?;
        session.send_response(
            server_response::UPDATE_SIGNAL_INDEX_CACHE,
            server_command::SUBSCRIBE,
            &serialized,
        );
        session
            .publisher
            .routing()
            .update_routes(session, &cache.signal_ids());
        session.tssc.lock().expect("tssc lock").reset_requested = true;
    }
    Ok(())
}

/// Client acknowledgment of a transmitted cache: promote `next` to
/// `current`, refresh routing, and request a streaming-codec reset; then
/// promote any pending cache off the read task.
pub(crate) fn handle_confirm_update_signal_index_cache(session: &Arc<SubscriberSession>) {
    let promoted = {
        let mut caches = session.caches.write().expect("cache lock");
        match caches.next.take() {
            Some(next) => {
                let transition = (
                    caches.current.as_ref().map(|current| current.count()),
                    caches.current_index,
                    caches.next_index,
                );
                caches.current = Some(Arc::clone(&next));
                caches.current_index = caches.next_index;
                Some((next, transition))
            }
            None => None,
        }
    };

    if let Some((next, (previous_count, previous_index, next_index))) = promoted {
        match previous_count {
            Some(previous_count) => tracing::info!(
                connection = %session.connection_id(),
                from_index = previous_index,
                from_records = previous_count,
                to_index = next_index,
                to_records = next.count(),
                "confirmed signal index cache update, transitioning caches"
            ),
            None => tracing::info!(
                connection = %session.connection_id(),
                to_index = next_index,
                to_records = next.count(),
                "confirmed signal index cache update, installing first cache"
            ),
        }
        session
            .publisher
            .routing()
            .update_routes(session, &next.signal_ids());
        session.tssc.lock().expect("tssc lock").reset_requested = true;
    }

    let session = Arc::clone(session);
    tokio::spawn(async move {
        let pending = session
            .pending_cache
            .lock()
            .expect("pending cache lock")
            .take();
        if let Some(pending) = pending {
            tracing::info!(
                connection = %session.connection_id(),
                records = pending.count(),
                "applying pending signal index cache update"
            );
            if let Err(err) = update_signal_index_cache(&session, pending) {
                tracing::error!(
                    connection = %session.connection_id(),
                    error = %err,
                    "pending signal index cache processing failed"
                );
            }
        }
    });
}

/// Bind a UDP socket on the command channel's local interface and connect it
/// to the subscriber's requested port. A dedicated writer task drains the
/// data-channel queue, idle until frames are enqueued.
async fn setup_data_channel(session: &Arc<SubscriberSession>, port: u16) -> Result<()> {
    // Reset any active channel on resubscribe.
    if session.is_data_channel_active() {
        session.deactivate_data_channel();
    }

    let socket = UdpSocket::bind(SocketAddr::new(session.local_ip(), 0))
        .await
        .context("bind UDP data channel")?;
    socket
        .connect(SocketAddr::new(session.ip_address(), port))
        .await
        .context("connect UDP data channel")?;

    let (sender, receiver) = mpsc::unbounded_channel();
    session.activate_data_channel(sender);
    tokio::spawn(writer::run_data_writer(
        Arc::clone(session),
        socket,
        receiver,
        session.cancel_rx(),
    ));
    tracing::info!(
        connection = %session.connection_id(),
        port,
        "UDP data channel established"
    );
    Ok(())
}
