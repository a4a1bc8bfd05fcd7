//! Transport layer: the command-channel accept loop and the per-subscriber
//! session state machine.

pub mod handlers;
pub mod lifecycle;
pub mod publication;
pub mod read_loop;
pub mod session;
pub mod subscription;
pub mod timers;
pub mod writer;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::publisher::Publisher;
use session::SubscriberSession;

pub use lifecycle::ReverseConnector;

/// Accept subscriber connections and spawn a session per socket.
pub async fn serve(listener: TcpListener, publisher: Arc<Publisher>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        metrics::counter!("gridpulse_connections_accepted_total").increment(1);
        tracing::info!(peer = %peer, "subscriber connected");
        if let Err(err) = SubscriberSession::start(Arc::clone(&publisher), stream, true) {
            tracing::warn!(peer = %peer, error = %err, "failed to start subscriber session");
        }
    }
}
