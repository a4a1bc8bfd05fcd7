//! Session timers: keep-alive ping, base-time rotation, and throttled
//! publication.
//!
//! Each timer is a task watching the session cancel channel; rotation and
//! throttled publication additionally watch a per-subscription cancel
//! channel so a re-subscribe stops the prior subscription's timers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use gridpulse_wire::commands::{server_command, server_response};
use gridpulse_wire::measurement::{state_flags, Measurement};
use gridpulse_wire::ticks;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

use crate::transport::publication;
use crate::transport::session::SubscriberSession;

const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Empty NoOP keep-alive on the command channel while the session lives.
pub(crate) fn spawn_ping(session: Arc<SubscriberSession>) {
    let mut cancel = session.cancel_rx();
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if session.is_stopped() {
                        break;
                    }
                    session.send_response(server_response::NO_OP, server_command::SUBSCRIBE, &[]);
                }
            }
        }
    });
}

/// Rotate base-time offsets for the compact encoder and push the new pair to
/// the subscriber.
pub(crate) fn spawn_base_time_rotation(
    session: Arc<SubscriberSession>,
    interval_ms: u64,
    mut subscription_cancel: watch::Receiver<bool>,
) {
    let mut cancel = session.cancel_rx();
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                changed = subscription_cancel.changed() => {
                    if changed.is_err() || *subscription_cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    rotate_base_times(&session, interval_ms);
                }
            }
        }
    });
}

/// One rotation step. Returns true when offsets were updated and sent.
pub(crate) fn rotate_base_times(session: &SubscriberSession, interval_ms: u64) -> bool {
    let use_local_clock = session
        .params
        .lock()
        .expect("params lock")
        .use_local_clock_as_real_time;
    let real_time = if use_local_clock {
        ticks::now()
    } else {
        session.latest_timestamp.load(Ordering::SeqCst)
    };
    if real_time == 0 {
        return false;
    }

    let interval_ticks = interval_ms as i64 * ticks::PER_MILLISECOND;
    let (time_index, offsets) = {
        let mut base_times = session.base_times.lock().expect("base time lock");
        if base_times.offsets[0] == 0 {
            base_times.offsets = [real_time, real_time + interval_ticks];
            base_times.time_index = 0;
        } else {
            // The inactive slot already holds the next base the client knows
            // about; flip to it and stage a fresh one behind it.
            let old_index = base_times.time_index as usize;
            base_times.time_index ^= 1;
            base_times.offsets[old_index] = real_time + interval_ticks;
        }
        (base_times.time_index, base_times.offsets)
    };

    let mut buffer = BytesMut::with_capacity(20);
    buffer.put_u32(time_index);
    buffer.put_i64(offsets[0]);
    buffer.put_i64(offsets[1]);
    session.send_response(
        server_response::UPDATE_BASE_TIMES,
        server_command::SUBSCRIBE,
        &buffer,
    );
    tracing::info!(
        connection = %session.connection_id(),
        time_index,
        "sent new base time offsets to subscriber"
    );
    true
}

/// Throttled publication: drain a snapshot of the latest-value map on each
/// tick, converting time-unreasonable samples to NaN with the bad-time flag
/// rather than dropping them.
pub(crate) fn spawn_throttled_publication(
    session: Arc<SubscriberSession>,
    interval_ms: u64,
    mut subscription_cancel: watch::Receiver<bool>,
) {
    let mut cancel = session.cancel_rx();
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                changed = subscription_cancel.changed() => {
                    if changed.is_err() || *subscription_cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    publish_latest_measurements(&session);
                }
            }
        }
    });
}

pub(crate) fn publish_latest_measurements(session: &SubscriberSession) {
    let (reasonability_check, lag_time, lead_time) = {
        let params = session.params.lock().expect("params lock");
        (
            params.enable_time_reasonability_check,
            params.lag_time,
            params.lead_time,
        )
    };
    let temporal = session.is_temporal_subscription();

    let measurements: Vec<Measurement> = {
        let latest = session
            .latest_measurements
            .lock()
            .expect("latest measurements lock");
        latest
            .values()
            .map(|measurement| {
                let mut measurement = *measurement;
                if reasonability_check
                    && !ticks::timestamp_is_reasonable(measurement.timestamp, lag_time, lead_time)
                    && !temporal
                {
                    measurement.value = f64::NAN;
                    measurement.flags |= state_flags::BAD_TIME;
                }
                measurement
            })
            .collect()
    };
    if measurements.is_empty() {
        return;
    }

    if session
        .using_payload_compression
        .load(Ordering::SeqCst)
    {
        publication::publish_tssc_measurements(session, &measurements);
    } else {
        publication::publish_compact_measurements(session, &measurements);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use crate::publisher::Publisher;
    use anyhow::Result;
    use bytes::{Buf, Bytes};
    use gridpulse_wire::commands::server_response;
    use gridpulse_wire::framing::ResponseFrame;
    use gridpulse_wire::PAYLOAD_HEADER_SIZE;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn started_session() -> Result<(Arc<SubscriberSession>, TcpStream)> {
        let (publisher, _events) = Publisher::new(PublisherConfig::from_env()?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (stream, _) = listener.accept().await?;
        let session = SubscriberSession::start(publisher, stream, true)?;
        Ok((session, client))
    }

    async fn read_frame(client: &mut TcpStream) -> Result<ResponseFrame> {
        let mut header = [0u8; PAYLOAD_HEADER_SIZE];
        client.read_exact(&mut header).await?;
        let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
        client.read_exact(&mut body).await?;
        Ok(ResponseFrame::decode(Bytes::from(body))?)
    }

    #[tokio::test]
    async fn rotation_initializes_then_flips_the_time_index() -> Result<()> {
        let (session, mut client) = started_session().await?;
        let interval_ms = 60_000u64;
        let interval_ticks = interval_ms as i64 * ticks::PER_MILLISECOND;

        // No observed timestamps yet, nothing to rotate against.
        assert!(!rotate_base_times(&session, interval_ms));

        let first = ticks::now();
        session.latest_timestamp.store(first, Ordering::SeqCst);
        assert!(rotate_base_times(&session, interval_ms));

        let frame = read_frame(&mut client).await?;
        assert_eq!(frame.response, server_response::UPDATE_BASE_TIMES);
        let mut data = frame.data.clone();
        assert_eq!(data.get_u32(), 0);
        assert_eq!(data.get_i64(), first);
        assert_eq!(data.get_i64(), first + interval_ticks);

        // The second rotation flips to the base the client already holds and
        // stages a fresh one behind it.
        let second = first + ticks::PER_SECOND;
        session.latest_timestamp.store(second, Ordering::SeqCst);
        assert!(rotate_base_times(&session, interval_ms));

        let frame = read_frame(&mut client).await?;
        let mut data = frame.data.clone();
        assert_eq!(data.get_u32(), 1);
        assert_eq!(data.get_i64(), second + interval_ticks);
        assert_eq!(data.get_i64(), first + interval_ticks);
        Ok(())
    }

    #[tokio::test]
    async fn throttled_publication_flags_unreasonable_timestamps() -> Result<()> {
        use gridpulse_wire::cache::SignalIndexCache;
        use gridpulse_wire::CompactMeasurement;
        use uuid::Uuid;

        let (session, mut client) = started_session().await?;
        let signal_id = Uuid::new_v4();
        let mut cache = SignalIndexCache::new();
        cache.add_record(signal_id, "PPA", 1);
        session.caches.write().expect("cache lock").current = Some(Arc::new(cache));
        session.subscribed.store(true, Ordering::SeqCst);

        // One stale sample, well outside the default lag window.
        session.latest_measurements.lock().expect("latest lock").insert(
            signal_id,
            Measurement {
                signal_id,
                timestamp: ticks::now() - 3_600 * ticks::PER_SECOND,
                flags: state_flags::NORMAL,
                value: 59.99,
            },
        );

        publish_latest_measurements(&session);

        let frame = read_frame(&mut client).await?;
        assert_eq!(frame.response, server_response::DATA_PACKET);
        let codec = CompactMeasurement::new([0, 0], true, false, 0);
        let mut body = frame.data.slice(5..);
        let (_, decoded) = codec.deserialize(&mut body)?;
        assert!(decoded.value.is_nan());
        assert_ne!(decoded.flags & state_flags::BAD_TIME, 0);
        Ok(())
    }
}

