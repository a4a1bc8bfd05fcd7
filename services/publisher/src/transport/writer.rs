//! Channel writer loops.
//!
//! Each session has one writer task per channel and that task is the only
//! code that ever writes to its socket half. Responses are enqueued onto the
//! channel's queue and drained here in order, so a single write is in flight
//! at any moment and frames never interleave. On a write failure the loop
//! funnels into the session's connection-error path and exits.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::transport::session::SubscriberSession;

pub(crate) async fn run_command_writer(
    session: Arc<SubscriberSession>,
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if *cancel.borrow() {
                    break;
                }
                if let Err(err) = write_half.write_all(&frame).await {
                    if !is_silent_disconnect(&err) {
                        tracing::warn!(
                            connection = %session.connection_id(),
                            error = %err,
                            "error writing to subscriber command channel"
                        );
                    }
                    session.handle_connection_error();
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

pub(crate) async fn run_data_writer(
    session: Arc<SubscriberSession>,
    socket: UdpSocket,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if *cancel.borrow() {
                    break;
                }
                if let Err(err) = socket.send(&frame).await {
                    if !is_silent_disconnect(&err) {
                        tracing::warn!(
                            connection = %session.connection_id(),
                            error = %err,
                            "error writing to subscriber data channel"
                        );
                    }
                    session.handle_connection_error();
                    break;
                }
            }
        }
    }
}

/// Peer teardown errors stop the session without a report.
pub(crate) fn is_silent_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
