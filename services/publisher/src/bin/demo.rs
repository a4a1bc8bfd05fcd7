// Console demo that exercises the publisher protocol over loopback TCP.
use anyhow::{Context, Result};
use bytes::Bytes;
use gridpulse_metadata::MetadataSet;
use gridpulse_wire::cache::SignalIndexCache;
use gridpulse_wire::commands::{server_command, server_response};
use gridpulse_wire::framing::{encode_command, ResponseFrame};
use gridpulse_wire::measurement::{state_flags, Measurement};
use gridpulse_wire::{ticks, PAYLOAD_HEADER_SIZE};
use publisher::config::PublisherConfig;
use publisher::{transport, Publisher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the demo output readable and step-by-step.
    println!("== Gridpulse Publisher Demo ==");
    println!("Goal: negotiate, subscribe, and stream measurements over loopback TCP.");

    println!("Step 1/5: booting publisher with synthetic metadata.");
    let config = PublisherConfig::from_env().context("load config")?;
    let (publisher, _events) = Publisher::new(config);

    let mut metadata = MetadataSet::new();
    let signals: Vec<Uuid> = (1..=3).map(|_| Uuid::new_v4()).collect();
    for (index, signal_id) in signals.iter().enumerate() {
        metadata.add_record(
            *signal_id,
            format!("DEMO:{}", index + 1),
            "FREQ",
            format!("Demo frequency {}", index + 1),
        );
    }
    publisher.set_metadata(metadata);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_task = tokio::spawn(transport::serve(listener, publisher.clone()));

    println!("Step 2/5: connecting subscriber client to {addr}.");
    let mut client = TcpStream::connect(addr).await?;

    println!("Step 3/5: negotiating operational modes (STTP v2, UTF-8).");
    send_command(
        &mut client,
        server_command::DEFINE_OPERATIONAL_MODES,
        &0x0000_0002u32.to_be_bytes(),
    )
    .await?;
    let response = read_response(&mut client).await?;
    println!("Negotiation response: {}", String::from_utf8_lossy(&response.data));

    println!("Step 4/5: subscribing to FREQ signals.");
    let connection_string =
        "filterExpression={FILTER ActiveMeasurements WHERE SignalType='FREQ'};includeTime=true";
    let mut payload = vec![0u8];
    payload.extend_from_slice(&(connection_string.len() as u32).to_be_bytes());
    payload.extend_from_slice(connection_string.as_bytes());
    send_command(&mut client, server_command::SUBSCRIBE, &payload).await?;

    let cache_update = read_response(&mut client).await?;
    let (cache_index, cache) =
        SignalIndexCache::deserialize(&cache_update.data, 2, Default::default(), false)?;
    println!(
        "Received signal index cache {} with {} signals.",
        cache_index,
        cache.count()
    );
    let subscribe_ack = read_response(&mut client).await?;
    println!(
        "Subscribe response: {}",
        String::from_utf8_lossy(&subscribe_ack.data)
    );

    send_command(
        &mut client,
        server_command::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE,
        &[],
    )
    .await?;

    println!("Step 5/5: publishing two measurement batches.");
    tokio::time::sleep(Duration::from_millis(100)).await;
    for round in 0..2u32 {
        let timestamp = ticks::now();
        let batch: Vec<Measurement> = signals
            .iter()
            .enumerate()
            .map(|(index, signal_id)| Measurement {
                signal_id: *signal_id,
                timestamp,
                flags: state_flags::NORMAL,
                value: 59.95 + f64::from(round) / 100.0 + index as f64 / 1000.0,
            })
            .collect();
        publisher.publish_measurements(&batch);
    }

    let start_time = read_response(&mut client).await?;
    assert_eq!(start_time.response, server_response::DATA_START_TIME);
    println!("DataStartTime received.");

    for _ in 0..2 {
        let packet = read_response(&mut client).await?;
        let count = i32::from_be_bytes(packet.data[1..5].try_into().unwrap());
        println!(
            "DataPacket: flags=0x{:02X}, {} measurements, {} bytes.",
            packet.data[0],
            count,
            packet.data.len()
        );
    }

    server_task.abort();
    println!("Demo complete.");
    Ok(())
}

async fn send_command(stream: &mut TcpStream, command: u8, payload: &[u8]) -> Result<()> {
    stream
        .write_all(&encode_command(command, payload))
        .await
        .context("send command")
}

async fn read_response(stream: &mut TcpStream) -> Result<ResponseFrame> {
    loop {
        let mut header = [0u8; PAYLOAD_HEADER_SIZE];
        stream.read_exact(&mut header).await.context("read header")?;
        let total = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; total];
        stream.read_exact(&mut body).await.context("read body")?;
        let frame = ResponseFrame::decode(Bytes::from(body))?;
        // Skip keep-alive pings.
        if frame.response != server_response::NO_OP {
            return Ok(frame);
        }
    }
}
