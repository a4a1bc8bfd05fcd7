//! Per-subscriber session state.
//!
//! One `SubscriberSession` exists per accepted (or dialed) client. It owns
//! the negotiated operational state, the subscription parameters, the
//! current/next/pending signal index caches, base-time offsets, the
//! throttled latest-value map, the streaming-codec state, and the outbound
//! queues for both channels. Reads are strictly sequential on the read task;
//! everything else synchronizes through the locks and atomics here and none
//! of them is held across an await.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gridpulse_wire::cache::SignalIndexCache;
use gridpulse_wire::commands::server_response;
use gridpulse_wire::framing::encode_response;
use gridpulse_wire::measurement::Measurement;
use gridpulse_wire::settings::parse_key_value_pairs;
use gridpulse_wire::{TextEncoding, TsscEncoder};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::publisher::{Publisher, PublisherEvent};
use crate::transport::lifecycle::ReverseConnector;
use crate::transport::{publication, read_loop, timers, writer};

pub(crate) const DEFAULT_LAG_TIME: f64 = 10.0;
pub(crate) const DEFAULT_LEAD_TIME: f64 = 5.0;
pub(crate) const DEFAULT_PUBLISH_INTERVAL: f64 = 1.0;

/// Negotiated operational state from `DefineOperationalModes`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Negotiated {
    pub modes: u32,
    pub encoding: TextEncoding,
    pub version: u8,
}

/// Subscription parameters parsed from the connection string.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionParams {
    pub include_time: bool,
    pub use_local_clock_as_real_time: bool,
    pub enable_time_reasonability_check: bool,
    pub lag_time: f64,
    pub lead_time: f64,
    pub publish_interval: f64,
    pub use_millisecond_resolution: bool,
    pub track_latest_measurements: bool,
    pub is_nan_filtered: bool,
    pub start_time_constraint: DateTime<Utc>,
    pub stop_time_constraint: DateTime<Utc>,
    pub subscription_info: String,
}

impl Default for SubscriptionParams {
    fn default() -> Self {
        Self {
            include_time: true,
            use_local_clock_as_real_time: false,
            enable_time_reasonability_check: true,
            lag_time: DEFAULT_LAG_TIME,
            lead_time: DEFAULT_LEAD_TIME,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            use_millisecond_resolution: false,
            track_latest_measurements: false,
            is_nan_filtered: false,
            start_time_constraint: DateTime::<Utc>::MAX_UTC,
            stop_time_constraint: DateTime::<Utc>::MAX_UTC,
            subscription_info: String::new(),
        }
    }
}

/// Current/next signal index caches and their one-bit generation indices.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub current: Option<Arc<SignalIndexCache>>,
    pub next: Option<Arc<SignalIndexCache>>,
    pub current_index: u8,
    pub next_index: u8,
}

/// Rotating base-time offsets for the compact encoder.
#[derive(Debug, Default)]
pub(crate) struct BaseTimeState {
    pub offsets: [i64; 2],
    pub time_index: u32,
}

/// Streaming-codec state guarded as one unit so resets order against
/// publication.
#[derive(Debug, Default)]
pub(crate) struct TsscState {
    pub encoder: TsscEncoder,
    pub reset_requested: bool,
    pub sequence: u16,
}

pub struct SubscriberSession {
    pub(crate) publisher: Arc<Publisher>,
    connection_id: String,
    ip_address: IpAddr,
    local_ip: IpAddr,
    instance_id: Uuid,
    subscriber_id: Mutex<Uuid>,

    pub(crate) negotiated: RwLock<Negotiated>,
    pub(crate) validated: AtomicBool,
    connection_accepted: AtomicBool,
    pub(crate) subscribed: AtomicBool,
    pub(crate) stopped: AtomicBool,
    stopping: AtomicBool,
    pub(crate) disconnecting: AtomicBool,
    pub(crate) data_channel_active: AtomicBool,
    pub(crate) start_time_sent: AtomicBool,
    pub(crate) using_payload_compression: AtomicBool,
    pub(crate) temporal_canceled: AtomicBool,
    processing_interval: AtomicI32,

    pub(crate) params: Mutex<SubscriptionParams>,
    pub(crate) caches: RwLock<CacheState>,
    pub(crate) pending_cache: Mutex<Option<SignalIndexCache>>,
    pub(crate) base_times: Mutex<BaseTimeState>,
    pub(crate) latest_timestamp: AtomicI64,
    pub(crate) latest_measurements: Mutex<HashMap<Uuid, Measurement>>,
    pub(crate) tssc: Mutex<TsscState>,

    command_tx: mpsc::UnboundedSender<Bytes>,
    data_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    cancel_tx: watch::Sender<bool>,
    subscription_cancel: Mutex<Option<watch::Sender<bool>>>,

    command_bytes_sent: AtomicU64,
    data_bytes_sent: AtomicU64,
    pub(crate) measurements_sent: AtomicU64,
    pub(crate) last_publish_time: Mutex<Option<DateTime<Utc>>>,

    reverse: Mutex<Option<Weak<ReverseConnector>>>,
}

impl SubscriberSession {
    /// Take ownership of a connected socket, spawn the session tasks, and
    /// register with the publisher.
    pub fn start(
        publisher: Arc<Publisher>,
        stream: TcpStream,
        connection_accepted: bool,
    ) -> Result<Arc<Self>> {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().context("peer address")?;
        let local = stream.local_addr().context("local address")?;
        let (read_half, write_half) = stream.into_split();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let peer_ip = canonical_ip(peer.ip());
        let mut params = SubscriptionParams::default();
        params.is_nan_filtered =
            publisher.is_nan_value_filter_allowed() && publisher.is_nan_value_filter_forced();

        let session = Arc::new(Self {
            publisher: Arc::clone(&publisher),
            connection_id: format!("{peer_ip}:{}", peer.port()),
            ip_address: peer_ip,
            local_ip: canonical_ip(local.ip()),
            instance_id: Uuid::new_v4(),
            subscriber_id: Mutex::new(Uuid::new_v4()),
            negotiated: RwLock::new(Negotiated {
                modes: 0,
                encoding: TextEncoding::Utf8,
                version: 0,
            }),
            validated: AtomicBool::new(false),
            connection_accepted: AtomicBool::new(connection_accepted),
            subscribed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            data_channel_active: AtomicBool::new(false),
            start_time_sent: AtomicBool::new(false),
            using_payload_compression: AtomicBool::new(false),
            temporal_canceled: AtomicBool::new(false),
            processing_interval: AtomicI32::new(-1),
            params: Mutex::new(params),
            caches: RwLock::new(CacheState::default()),
            pending_cache: Mutex::new(None),
            base_times: Mutex::new(BaseTimeState::default()),
            latest_timestamp: AtomicI64::new(0),
            latest_measurements: Mutex::new(HashMap::new()),
            tssc: Mutex::new(TsscState::default()),
            command_tx,
            data_tx: Mutex::new(None),
            cancel_tx,
            subscription_cancel: Mutex::new(None),
            command_bytes_sent: AtomicU64::new(0),
            data_bytes_sent: AtomicU64::new(0),
            measurements_sent: AtomicU64::new(0),
            last_publish_time: Mutex::new(None),
            reverse: Mutex::new(None),
        });

        tokio::spawn(writer::run_command_writer(
            Arc::clone(&session),
            write_half,
            command_rx,
            cancel_rx,
        ));
        tokio::spawn(read_loop::run_read_loop(
            Arc::clone(&session),
            read_half,
            session.cancel_rx(),
        ));
        if connection_accepted {
            timers::spawn_ping(Arc::clone(&session));
        }

        publisher.register_session(Arc::clone(&session));
        tracing::info!(connection = %session.connection_id, "subscriber session started");
        Ok(session)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn ip_address(&self) -> IpAddr {
        self.ip_address
    }

    pub(crate) fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subscriber_id(&self) -> Uuid {
        *self.subscriber_id.lock().expect("subscriber id lock")
    }

    pub fn set_subscriber_id(&self, id: Uuid) {
        *self.subscriber_id.lock().expect("subscriber id lock") = id;
    }

    pub fn version(&self) -> u8 {
        self.negotiated.read().expect("negotiated lock").version
    }

    pub(crate) fn set_version(&self, version: u8) {
        self.negotiated.write().expect("negotiated lock").version = version;
    }

    pub fn operational_modes(&self) -> u32 {
        self.negotiated.read().expect("negotiated lock").modes
    }

    pub fn encoding(&self) -> TextEncoding {
        self.negotiated.read().expect("negotiated lock").encoding
    }

    /// Store negotiated modes and derive the text encoding, warning on the
    /// deprecated UTF-16 variants and falling back to UTF-8 when the
    /// encoding bits are unrecognized.
    pub fn set_operational_modes(&self, modes: u32) {
        let encoding = match TextEncoding::from_modes(modes) {
            Some(TextEncoding::Utf8) => TextEncoding::Utf8,
            Some(encoding) => {
                tracing::warn!(
                    connection = %self.connection_id,
                    "client requested deprecated UTF-16 character encoding; \
                     future protocol revisions only support UTF-8"
                );
                encoding
            }
            None => {
                tracing::warn!(
                    connection = %self.connection_id,
                    encoding_bits = %format!("0x{modes:08X}"),
                    "unsupported character encoding detected, defaulting to UTF-8"
                );
                TextEncoding::Utf8
            }
        };
        let mut negotiated = self.negotiated.write().expect("negotiated lock");
        negotiated.modes = modes;
        negotiated.encoding = encoding;
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connection_accepted.store(connected, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn is_temporal_subscription(&self) -> bool {
        self.params.lock().expect("params lock").start_time_constraint < DateTime::<Utc>::MAX_UTC
    }

    pub fn processing_interval(&self) -> i32 {
        self.processing_interval.load(Ordering::SeqCst)
    }

    /// Store a processing interval without dispatching a change event, as
    /// when the value arrives inside a subscription connection string.
    pub(crate) fn store_processing_interval(&self, interval: i32) {
        self.processing_interval.store(interval, Ordering::SeqCst);
    }

    pub fn set_processing_interval(&self, interval: i32) {
        self.processing_interval.store(interval, Ordering::SeqCst);
        self.publisher
            .dispatch(PublisherEvent::ProcessingIntervalChangeRequested {
                instance_id: self.instance_id,
                interval,
            });
        tracing::info!(
            connection = %self.connection_id,
            interval_ms = interval,
            "assigned a new processing interval"
        );
    }

    /// Normalize reported client assembly information.
    pub fn set_subscription_info(&self, value: &str) {
        let mut params = self.params.lock().expect("params lock");
        if value.trim().is_empty() {
            params.subscription_info.clear();
            return;
        }
        let settings = parse_key_value_pairs(value);
        let get = |key: &str, fallback: &str| {
            settings
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };
        let source = get("source", "unknown source");
        let version = get("version", "?.?.?.?");
        let updated_on = get("updatedon", "undefined date");
        params.subscription_info = format!("{source} version {version} updated on {updated_on}");
    }

    pub fn subscription_info(&self) -> String {
        self.params
            .lock()
            .expect("params lock")
            .subscription_info
            .clone()
    }

    /// The cache the client is currently publishing against.
    pub fn signal_index_cache(&self) -> Option<Arc<SignalIndexCache>> {
        self.caches.read().expect("cache lock").current.clone()
    }

    /// Current cache plus its one-bit generation index, snapshotted together
    /// so outgoing packets are tagged against the cache they serialize with.
    pub(crate) fn current_cache_with_index(&self) -> Option<(Arc<SignalIndexCache>, u8)> {
        let caches = self.caches.read().expect("cache lock");
        caches
            .current
            .clone()
            .map(|cache| (cache, caches.current_index))
    }

    pub fn total_command_channel_bytes_sent(&self) -> u64 {
        self.command_bytes_sent.load(Ordering::SeqCst)
    }

    pub fn total_data_channel_bytes_sent(&self) -> u64 {
        self.data_bytes_sent.load(Ordering::SeqCst)
    }

    pub fn total_measurements_sent(&self) -> u64 {
        self.measurements_sent.load(Ordering::SeqCst)
    }

    pub fn last_publish_time(&self) -> Option<DateTime<Utc>> {
        *self.last_publish_time.lock().expect("publish time lock")
    }

    /// Deliver a batch of measurements to this subscriber.
    pub fn publish_measurements(&self, measurements: &[Measurement]) {
        publication::publish_measurements(self, measurements);
    }

    pub(crate) fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn signal_cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Replace the per-subscription cancel channel, stopping any timers the
    /// previous subscription started.
    pub(crate) fn new_subscription_cancel(&self) -> watch::Receiver<bool> {
        let mut slot = self.subscription_cancel.lock().expect("subscription cancel");
        if let Some(previous) = slot.take() {
            let _ = previous.send(true);
        }
        let (tx, rx) = watch::channel(false);
        *slot = Some(tx);
        rx
    }

    pub(crate) fn stop_subscription_timers(&self) {
        if let Some(previous) = self
            .subscription_cancel
            .lock()
            .expect("subscription cancel")
            .take()
        {
            let _ = previous.send(true);
        }
    }

    pub(crate) fn activate_data_channel(&self, sender: mpsc::UnboundedSender<Bytes>) {
        *self.data_tx.lock().expect("data sender lock") = Some(sender);
        self.data_channel_active.store(true, Ordering::SeqCst);
    }

    /// Drop the data-channel queue; the writer task exits when its receiver
    /// drains.
    pub(crate) fn deactivate_data_channel(&self) {
        self.data_channel_active.store(false, Ordering::SeqCst);
        self.data_tx.lock().expect("data sender lock").take();
    }

    pub fn is_data_channel_active(&self) -> bool {
        self.data_channel_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reverse_connector(&self, connector: Weak<ReverseConnector>) {
        *self.reverse.lock().expect("reverse lock") = Some(connector);
    }

    pub(crate) fn reverse_connector(&self) -> Option<Arc<ReverseConnector>> {
        self.reverse
            .lock()
            .expect("reverse lock")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Queue a response frame on the appropriate channel. Data packets and
    /// buffer blocks ride the UDP data channel when one is active; all other
    /// responses use the TCP command channel.
    pub fn send_response(&self, response: u8, command: u8, data: &[u8]) -> bool {
        if self.is_stopped() {
            return false;
        }
        let use_data_channel = self.is_data_channel_active()
            && matches!(
                response,
                server_response::DATA_PACKET | server_response::BUFFER_BLOCK
            );
        let data_sender = if use_data_channel {
            self.data_tx.lock().expect("data sender lock").clone()
        } else {
            None
        };
        match data_sender {
            Some(sender) => {
                let frame = encode_response(response, command, data, false);
                self.data_bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::SeqCst);
                metrics::counter!("gridpulse_data_channel_bytes_sent_total")
                    .increment(frame.len() as u64);
                sender.send(frame).is_ok()
            }
            None => {
                let frame = encode_response(response, command, data, true);
                self.command_bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::SeqCst);
                metrics::counter!("gridpulse_command_channel_bytes_sent_total")
                    .increment(frame.len() as u64);
                self.command_tx.send(frame).is_ok()
            }
        }
    }

    /// Queue a response whose data is a string in the negotiated encoding.
    pub fn send_response_message(&self, response: u8, command: u8, message: &str) -> bool {
        let data = self.encoding().encode(message);
        self.send_response(response, command, &data)
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    // Strip the dual-stack ::ffff: prefix so UDP channels bind cleanly.
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
