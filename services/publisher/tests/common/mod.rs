//! Shared helpers for the protocol integration tests: a publisher bootstrap
//! and a minimal subscriber-side client speaking the wire protocol over
//! loopback sockets.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use gridpulse_metadata::MetadataSet;
use gridpulse_wire::commands::{data_packet_flags, server_command, server_response};
use gridpulse_wire::framing::{encode_command, ResponseFrame};
use gridpulse_wire::measurement::{state_flags, Measurement};
use gridpulse_wire::{ticks, PAYLOAD_HEADER_SIZE};
use publisher::config::PublisherConfig;
use publisher::{transport, Publisher, PublisherEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

pub fn test_config() -> PublisherConfig {
    PublisherConfig {
        bind: "127.0.0.1:0".parse().expect("bind addr"),
        metrics_bind: "127.0.0.1:0".parse().expect("metrics addr"),
        allow_nan_value_filter: true,
        force_nan_value_filter: false,
        allow_temporal_subscriptions: false,
        allow_metadata_refresh: true,
        use_base_time_offsets: true,
    }
}

/// Build an `ActiveMeasurements` table with the requested signal types.
pub fn metadata_with_signals(groups: &[(&str, usize)]) -> (MetadataSet, Vec<Uuid>) {
    let mut set = MetadataSet::new();
    let mut signal_ids = Vec::new();
    let mut key = 1;
    for (signal_type, count) in groups {
        for _ in 0..*count {
            let signal_id = Uuid::new_v4();
            set.add_record(
                signal_id,
                format!("PPA:{key}"),
                *signal_type,
                format!("{signal_type} signal {key}"),
            );
            signal_ids.push(signal_id);
            key += 1;
        }
    }
    (set, signal_ids)
}

pub fn batch(signal_ids: &[Uuid], value: f64) -> Vec<Measurement> {
    let timestamp = ticks::now();
    signal_ids
        .iter()
        .map(|signal_id| Measurement {
            signal_id: *signal_id,
            timestamp,
            flags: state_flags::NORMAL,
            value,
        })
        .collect()
}

pub struct TestPublisher {
    pub publisher: Arc<Publisher>,
    pub addr: SocketAddr,
    pub events: UnboundedReceiver<PublisherEvent>,
}

pub async fn start_publisher(
    config: PublisherConfig,
    metadata: MetadataSet,
) -> Result<TestPublisher> {
    let (publisher, events) = Publisher::new(config);
    publisher.set_metadata(metadata);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(transport::serve(listener, Arc::clone(&publisher)));
    Ok(TestPublisher {
        publisher,
        addr,
        events,
    })
}

pub struct TestClient {
    pub stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect client")?;
        Ok(Self { stream })
    }

    pub async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(&encode_command(command, payload))
            .await
            .context("send command")
    }

    /// Write a raw payload-size header, for non-protocol traffic tests.
    pub async fn send_raw_header(&mut self, payload_size: u32) -> Result<()> {
        self.stream
            .write_all(&payload_size.to_be_bytes())
            .await
            .context("send raw header")
    }

    pub async fn define_operational_modes(&mut self, modes: u32) -> Result<ResponseFrame> {
        self.send_command(
            server_command::DEFINE_OPERATIONAL_MODES,
            &modes.to_be_bytes(),
        )
        .await?;
        self.read_response().await
    }

    /// Issue a subscribe with the compact-format flag set.
    pub async fn subscribe(&mut self, connection_string: &str) -> Result<()> {
        let encoded = connection_string.as_bytes();
        let mut payload = vec![data_packet_flags::COMPACT];
        payload.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        payload.extend_from_slice(encoded);
        self.send_command(server_command::SUBSCRIBE, &payload).await
    }

    pub async fn confirm_signal_index_cache(&mut self) -> Result<()> {
        self.send_command(server_command::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE, &[])
            .await
    }

    /// Read the next response frame, skipping keep-alive pings.
    pub async fn read_response(&mut self) -> Result<ResponseFrame> {
        loop {
            let frame = timeout(READ_TIMEOUT, self.read_frame())
                .await
                .context("timed out waiting for response")??;
            if frame.response != server_response::NO_OP {
                return Ok(frame);
            }
        }
    }

    async fn read_frame(&mut self) -> Result<ResponseFrame> {
        let mut header = [0u8; PAYLOAD_HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .await
            .context("read response header")?;
        let total = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; total];
        self.stream
            .read_exact(&mut body)
            .await
            .context("read response body")?;
        ResponseFrame::decode(Bytes::from(body)).context("decode response")
    }

    /// Expect the server to close the connection without further responses.
    pub async fn expect_closed(&mut self) -> Result<()> {
        let mut buffer = [0u8; 64];
        loop {
            match timeout(READ_TIMEOUT, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => bail!("unexpected data while waiting for close"),
                Ok(Err(_)) => return Ok(()),
                Err(_) => bail!("timed out waiting for server to close the connection"),
            }
        }
    }
}
