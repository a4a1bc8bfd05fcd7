//! Command-channel read loop and dispatch.
//!
//! Reads are strictly sequential: a four-byte big-endian payload size, then
//! exactly that many payload bytes, then dispatch on the leading command
//! byte. Until the session is validated by `DefineOperationalModes` the
//! loop enforces two gates against non-protocol traffic: an initial-packet
//! size cap and a whitelist of exactly one command.

use std::sync::Arc;
use std::time::Duration;

use gridpulse_wire::commands::{server_command, server_response};
use gridpulse_wire::PAYLOAD_HEADER_SIZE;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use crate::transport::handlers;
use crate::transport::session::SubscriberSession;
use crate::transport::subscription;
use crate::transport::writer::is_silent_disconnect;

// The first command must be DefineOperationalModes, whose payload is a
// parameter string; anything past 8 KiB is suspect non-protocol traffic.
const MAX_INITIAL_PACKET_SIZE: usize = PAYLOAD_HEADER_SIZE + 1 + 8192;

pub(crate) async fn run_read_loop(
    session: Arc<SubscriberSession>,
    mut read_half: OwnedReadHalf,
    mut cancel: watch::Receiver<bool>,
) {
    let mut header = [0u8; PAYLOAD_HEADER_SIZE];
    let mut payload: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            result = read_half.read_exact(&mut header) => {
                if let Err(err) = result {
                    report_read_error(&session, err);
                    break;
                }
                let packet_size = u32::from_be_bytes(header) as usize;

                if !session.is_validated() && packet_size > MAX_INITIAL_PACKET_SIZE {
                    tracing::error!(
                        connection = %session.connection_id(),
                        packet_size,
                        "possible invalid protocol detected: oversized initial packet, \
                         connection likely from a non-protocol client, disconnecting"
                    );
                    session.stop();
                    break;
                }

                payload.resize(packet_size, 0);
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    result = read_half.read_exact(&mut payload[..]) => {
                        if let Err(err) = result {
                            report_read_error(&session, err);
                            break;
                        }
                        if payload.is_empty() {
                            continue;
                        }
                        if !dispatch(&session, payload[0], &payload[1..]).await {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn report_read_error(session: &Arc<SubscriberSession>, err: std::io::Error) {
    if !is_silent_disconnect(&err) {
        tracing::warn!(
            connection = %session.connection_id(),
            error = %err,
            "error reading from subscriber command channel"
        );
    }
    session.handle_connection_error();
}

/// Route one decoded command. Returns `false` when the loop must stop
/// reading (the session is being torn down).
async fn dispatch(session: &Arc<SubscriberSession>, command: u8, payload: &[u8]) -> bool {
    if !session.is_validated() && command != server_command::DEFINE_OPERATIONAL_MODES {
        let message = format!(
            "Requested server command {} from client \"{}\" rejected before operational modes \
             validation -- possible non-protocol client -- disconnecting client",
            server_command::name(command),
            session.connection_id()
        );
        tracing::error!(connection = %session.connection_id(), "{message}");
        session.send_response_message(server_response::FAILED, command, &message);
        spawn_delayed_stop(session);
        return false;
    }

    match command {
        server_command::SUBSCRIBE => subscription::handle_subscribe(session, payload).await,
        server_command::UNSUBSCRIBE => handlers::handle_unsubscribe(session),
        server_command::METADATA_REFRESH => handlers::handle_metadata_refresh(session, payload),
        server_command::ROTATE_CIPHER_KEYS => handlers::handle_rotate_cipher_keys(session),
        server_command::UPDATE_PROCESSING_INTERVAL => {
            handlers::handle_update_processing_interval(session, payload)
        }
        server_command::DEFINE_OPERATIONAL_MODES => {
            handlers::handle_define_operational_modes(session, payload)
        }
        server_command::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE => {
            subscription::handle_confirm_update_signal_index_cache(session)
        }
        server_command::CONFIRM_NOTIFICATION => handlers::handle_confirm_notification(session),
        server_command::CONFIRM_BUFFER_BLOCK => handlers::handle_confirm_buffer_block(session),
        server_command::CONFIRM_UPDATE_BASE_TIMES => {
            handlers::handle_confirm_update_base_times(session)
        }
        command if server_command::is_user_command(command) => {
            handlers::handle_user_command(session, command, payload)
        }
        command => {
            let message = format!(
                "\"{}\" sent an unrecognized server command: {}",
                session.connection_id(),
                server_command::name(command)
            );
            session.send_response_message(server_response::FAILED, command, &message);
            tracing::error!(connection = %session.connection_id(), "{message}");
        }
    }
    true
}

/// Give a failure response a moment to flush before tearing down.
pub(crate) fn spawn_delayed_stop(session: &Arc<SubscriberSession>) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.stop();
    });
}
