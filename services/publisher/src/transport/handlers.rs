//! Command handlers outside the subscribe path.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use gridpulse_metadata::ACTIVE_MEASUREMENTS;
use gridpulse_wire::commands::{
    compression_modes, operational_modes, server_command, server_response,
};

use crate::publisher::PublisherEvent;
use crate::transport::read_loop::spawn_delayed_stop;
use crate::transport::session::SubscriberSession;
use crate::transport::subscription;

/// Negotiate protocol version and operational modes. This is the only
/// command accepted before validation.
pub(crate) fn handle_define_operational_modes(session: &Arc<SubscriberSession>, payload: &[u8]) {
    if payload.len() < 4 {
        return;
    }

    let modes = u32::from_be_bytes(payload[0..4].try_into().expect("four bytes"));
    let version = (modes & operational_modes::VERSION_MASK) as u8;

    if !(1..=3).contains(&version) {
        let message = format!(
            "Client connection rejected: requested protocol version {version} not supported. \
             This data publisher implementation only supports version 1 to 3 of the protocol."
        );
        tracing::error!(
            connection = %session.connection_id(),
            "{message} Operational modes may not be set correctly -- disconnecting client"
        );
        session.send_response_message(
            server_response::FAILED,
            server_command::DEFINE_OPERATIONAL_MODES,
            &message,
        );
        spawn_delayed_stop(session);
        return;
    }

    session.set_version(version);
    if version > 1 {
        // Double-buffered cache swap starts at version 2; seed the current
        // index so the first transmitted cache lands on index zero.
        session.caches.write().expect("cache lock").current_index = 1;
    }
    session.set_operational_modes(modes);

    let message =
        format!("STTP v{version} client connection accepted: requested operational modes applied.");
    tracing::info!(connection = %session.connection_id(), "{message}");

    session
        .validated
        .store(true, std::sync::atomic::Ordering::SeqCst);
    session.send_response_message(
        server_response::SUCCEEDED,
        server_command::DEFINE_OPERATIONAL_MODES,
        &message,
    );
}

pub(crate) fn handle_unsubscribe(session: &Arc<SubscriberSession>) {
    session
        .subscribed
        .store(false, std::sync::atomic::Ordering::SeqCst);
    if session.is_temporal_subscription() {
        subscription::cancel_temporal_subscription(session);
    }
}

/// Serve the metadata dataset, optionally filtered by client expressions and
/// gzip-compressed when negotiated.
pub(crate) fn handle_metadata_refresh(session: &Arc<SubscriberSession>, payload: &[u8]) {
    if !session.publisher.is_metadata_refresh_allowed() {
        let message = "Meta-data refresh has been disallowed by the data publisher.";
        session.send_response_message(
            server_response::FAILED,
            server_command::METADATA_REFRESH,
            message,
        );
        tracing::error!(connection = %session.connection_id(), "{message}");
        return;
    }

    tracing::info!(
        connection = %session.connection_id(),
        "received meta-data refresh request, preparing response"
    );
    let start_time = Utc::now();

    // Client filter expressions apply to the in-memory dataset only; parse
    // failures degrade to serving the full dataset.
    let mut table_filters: HashMap<String, String> = HashMap::new();
    if payload.len() > 4 {
        let length = u32::from_be_bytes(payload[0..4].try_into().expect("four bytes")) as usize;
        if payload.len() >= length + 4 {
            match session.encoding().decode(&payload[4..4 + length]) {
                Ok(expression) if !expression.trim().is_empty() => {
                    table_filters.insert(ACTIVE_MEASUREMENTS.to_string(), expression);
                }
                Ok(_) => {}
                Err(err) => tracing::error!(
                    connection = %session.connection_id(),
                    error = %err,
                    "failed to parse subscriber provided meta-data filter expressions"
                ),
            }
        }
    }

    let metadata = session.publisher.metadata();
    if metadata.is_empty() {
        tracing::info!(
            connection = %session.connection_id(),
            "no meta-data has been defined by the publisher, sending an empty response"
        );
        session.send_response(server_response::SUCCEEDED, server_command::METADATA_REFRESH, &[]);
        return;
    }

    let serialized = match metadata.serialize(&table_filters) {
        Ok(serialized) => serialized,
        Err(err) => {
            // A bad filter expression fails the refresh with the parser text.
            let message = format!("Failed to transfer meta-data: {err}");
            session.send_response_message(
                server_response::FAILED,
                server_command::METADATA_REFRESH,
                &message,
            );
            tracing::error!(connection = %session.connection_id(), "{message}");
            return;
        }
    };

    let modes = session.operational_modes();
    let compress = modes & operational_modes::COMPRESS_METADATA != 0
        && modes & compression_modes::GZIP != 0;
    let serialized = if compress {
        let compressed = (|| {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&serialized)?;
            encoder.finish()
        })();
        match compressed {
            Ok(compressed) => compressed,
            Err(err) => {
                let message = format!("Failed to compress meta-data: {err}");
                session.send_response_message(
                    server_response::FAILED,
                    server_command::METADATA_REFRESH,
                    &message,
                );
                tracing::error!(connection = %session.connection_id(), "{message}");
                return;
            }
        }
    } else {
        serialized
    };

    let elapsed = Utc::now() - start_time;
    tracing::info!(
        connection = %session.connection_id(),
        records = metadata.len(),
        elapsed_ms = elapsed.num_milliseconds(),
        "meta-data prepared, sending response"
    );
    session.send_response(
        server_response::SUCCEEDED,
        server_command::METADATA_REFRESH,
        &serialized,
    );
}

pub(crate) fn handle_update_processing_interval(session: &Arc<SubscriberSession>, payload: &[u8]) {
    if payload.len() >= 4 {
        let interval = i32::from_be_bytes(payload[0..4].try_into().expect("four bytes"));
        session.set_processing_interval(interval);
        session.send_response_message(
            server_response::SUCCEEDED,
            server_command::UPDATE_PROCESSING_INTERVAL,
            &format!("New processing interval of {interval} assigned."),
        );
    } else {
        let message = "Not enough buffer was provided to update client processing interval.";
        session.send_response_message(
            server_response::FAILED,
            server_command::UPDATE_PROCESSING_INTERVAL,
            message,
        );
        tracing::error!(connection = %session.connection_id(), "{message}");
    }
}

// Reserved commands: accepted without a response until a future protocol
// revision assigns semantics.

pub(crate) fn handle_rotate_cipher_keys(_session: &Arc<SubscriberSession>) {}

pub(crate) fn handle_confirm_notification(_session: &Arc<SubscriberSession>) {}

pub(crate) fn handle_confirm_buffer_block(_session: &Arc<SubscriberSession>) {}

pub(crate) fn handle_confirm_update_base_times(_session: &Arc<SubscriberSession>) {}

pub(crate) fn handle_user_command(session: &Arc<SubscriberSession>, command: u8, payload: &[u8]) {
    session.publisher.dispatch(PublisherEvent::UserCommand {
        instance_id: session.instance_id(),
        command,
        payload: payload.to_vec(),
    });
}
