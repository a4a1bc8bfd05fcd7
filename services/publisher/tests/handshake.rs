//! Connection validation: operational-mode negotiation, the pre-validation
//! command gate, and non-protocol traffic defense.

mod common;

use anyhow::Result;
use common::{metadata_with_signals, start_publisher, test_config, TestClient};
use gridpulse_wire::commands::{server_command, server_response};
use publisher::transport::ReverseConnector;
use publisher::Publisher;
use tokio::net::TcpListener;

#[tokio::test]
async fn version_two_handshake_is_accepted() -> Result<()> {
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    let server = start_publisher(test_config(), metadata).await?;
    let mut client = TestClient::connect(server.addr).await?;

    let response = client.define_operational_modes(0x0000_0002).await?;
    assert_eq!(response.response, server_response::SUCCEEDED);
    assert_eq!(response.command, server_command::DEFINE_OPERATIONAL_MODES);
    let message = String::from_utf8(response.data.to_vec())?;
    assert!(message.contains("STTP v2 client connection accepted"));
    Ok(())
}

#[tokio::test]
async fn unsupported_protocol_version_is_rejected() -> Result<()> {
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    let server = start_publisher(test_config(), metadata).await?;
    let mut client = TestClient::connect(server.addr).await?;

    let response = client.define_operational_modes(0x0000_0009).await?;
    assert_eq!(response.response, server_response::FAILED);
    let message = String::from_utf8(response.data.to_vec())?;
    assert!(message.contains("protocol version 9 not supported"));

    client.expect_closed().await?;
    Ok(())
}

#[tokio::test]
async fn commands_before_validation_stop_the_session() -> Result<()> {
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    let server = start_publisher(test_config(), metadata).await?;
    let mut client = TestClient::connect(server.addr).await?;

    client.subscribe("filterExpression={}").await?;
    let response = client.read_response().await?;
    assert_eq!(response.response, server_response::FAILED);
    assert_eq!(response.command, server_command::SUBSCRIBE);

    client.expect_closed().await?;
    Ok(())
}

#[tokio::test]
async fn oversized_initial_packet_is_treated_as_non_protocol_traffic() -> Result<()> {
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    let server = start_publisher(test_config(), metadata).await?;
    let mut client = TestClient::connect(server.addr).await?;

    // A length field of 1 MiB before validation marks a non-protocol client.
    client.send_raw_header(1_048_576).await?;
    client.expect_closed().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_commands_fail_without_dropping_the_session() -> Result<()> {
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    let server = start_publisher(test_config(), metadata).await?;
    let mut client = TestClient::connect(server.addr).await?;

    client.define_operational_modes(0x0000_0002).await?;
    client.send_command(0x7F, &[]).await?;
    let response = client.read_response().await?;
    assert_eq!(response.response, server_response::FAILED);
    assert_eq!(response.command, 0x7F);

    // Session still serves requests afterwards.
    client.send_command(server_command::METADATA_REFRESH, &[]).await?;
    let response = client.read_response().await?;
    assert_eq!(response.response, server_response::SUCCEEDED);
    assert_eq!(response.command, server_command::METADATA_REFRESH);
    Ok(())
}

#[tokio::test]
async fn reverse_connection_dials_the_subscriber() -> Result<()> {
    let (publisher, _events) = Publisher::new(test_config());
    let (metadata, _) = metadata_with_signals(&[("FREQ", 1)]);
    publisher.set_metadata(metadata);

    // The subscriber listens; the publisher dials it.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = listener.local_addr()?;
    let connector = ReverseConnector::new(publisher, endpoint.to_string());

    let accept = tokio::spawn(async move { listener.accept().await });
    let session = connector.connect().await?;
    assert!(session.is_connected());

    let (stream, _) = accept.await??;
    let mut subscriber = TestClient { stream };
    let response = subscriber.define_operational_modes(0x0000_0002).await?;
    assert_eq!(response.response, server_response::SUCCEEDED);

    // A second connect while active is refused.
    assert!(connector.connect().await.is_err());

    connector.disconnect().await;
    assert!(connector.session().is_none());
    subscriber.expect_closed().await?;
    Ok(())
}
