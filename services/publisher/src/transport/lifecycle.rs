//! Connection teardown and reverse-connection coordination.
//!
//! `stop_connection` is the sole teardown primitive: it is idempotent,
//! cooperates with pending reads and writes through the cancel channel, and
//! stops timers before the sockets close. In reverse-connection mode the
//! publisher dials the subscriber; connect and disconnect serialize on a
//! connector-level mutex so destruction never races a pending connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::publisher::Publisher;
use crate::transport::handlers;
use crate::transport::session::SubscriberSession;

impl SubscriberSession {
    /// Stop this session. Reverse connections route through the connector's
    /// detached cleanup so a pending connect cannot race destruction.
    pub fn stop(self: &Arc<Self>) {
        if self.publisher.is_reverse_connection() {
            if let Some(connector) = self.reverse_connector() {
                connector.begin_disconnect(false);
                return;
            }
        }
        self.stop_connection();
    }

    /// Idempotent teardown: unsubscribe, stop timers, cancel both channel
    /// loops, close the data channel, and notify the container.
    pub fn stop_connection(self: &Arc<Self>) {
        if !self.begin_stop() {
            return;
        }

        if self.is_subscribed() {
            handlers::handle_unsubscribe(self);
        }

        self.validated.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_subscription_timers();
        self.signal_cancel();

        if self.data_channel_active.load(Ordering::SeqCst) {
            self.deactivate_data_channel();
        }
        self.set_connected(false);

        tracing::info!(connection = %self.connection_id(), "subscriber session stopped");
        self.publisher.connection_terminated(self);
    }

    /// Transport failure on either channel: silent teardown, or a detached
    /// disconnect in reverse-connection mode so the caller's read/write task
    /// can unwind first.
    pub(crate) fn handle_connection_error(self: &Arc<Self>) {
        if self.publisher.is_reverse_connection() {
            if let Some(connector) = self.reverse_connector() {
                connector.begin_disconnect(true);
                return;
            }
        }
        self.stop_connection();
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }
}

/// Reverse-connection coordinator: the publisher dials the subscriber.
pub struct ReverseConnector {
    publisher: Arc<Publisher>,
    endpoint: String,
    // Serializes connect against disconnect so a teardown never interleaves
    // with an in-flight connect.
    connect_action: tokio::sync::Mutex<()>,
    session: Mutex<Option<Arc<SubscriberSession>>>,
    disconnect_task: Mutex<Option<JoinHandle<()>>>,
    disconnecting: AtomicBool,
    auto_reconnect: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ReverseConnector {
    pub fn new(publisher: Arc<Publisher>, endpoint: impl Into<String>) -> Arc<Self> {
        publisher.set_reverse_connection(true);
        Arc::new(Self {
            publisher,
            endpoint: endpoint.into(),
            connect_action: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            disconnect_task: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            auto_reconnect: Mutex::new(None),
        })
    }

    /// Invoked after an auto-reconnecting disconnect completes, unless the
    /// publisher is disposing.
    pub fn set_auto_reconnect(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        *self.auto_reconnect.lock().expect("auto reconnect lock") = Some(callback);
    }

    pub fn session(&self) -> Option<Arc<SubscriberSession>> {
        self.session.lock().expect("session lock").clone()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Dial the subscriber and start a session over the established socket.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<SubscriberSession>> {
        let connected = self
            .session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|session| session.is_connected())
            .unwrap_or(false);
        if connected {
            bail!("Publisher is already connected; disconnect first");
        }

        // Let any pending disconnect complete so the prior socket is closed.
        let pending = self.disconnect_task.lock().expect("disconnect task lock").take();
        if let Some(task) = pending {
            let _ = task.await;
        }

        let _guard = self.connect_action.lock().await;
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .with_context(|| format!("connect to subscriber at {}", self.endpoint))?;
        let session = SubscriberSession::start(Arc::clone(&self.publisher), stream, true)?;
        session.set_reverse_connector(Arc::downgrade(self));
        *self.session.lock().expect("session lock") = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Launch a detached cleanup task. `auto_reconnecting` marks teardown
    /// initiated by the terminated connection itself, which must not block
    /// on the connect mutex its own connect still holds.
    pub fn begin_disconnect(self: &Arc<Self>, auto_reconnecting: bool) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.lock().expect("session lock").as_ref() {
            session.disconnecting.store(true, Ordering::SeqCst);
        }

        let connector = Arc::clone(self);
        let task = tokio::spawn(async move {
            let guard = if auto_reconnecting {
                None
            } else {
                Some(connector.connect_action.lock().await)
            };

            let session = connector.session.lock().expect("session lock").take();
            if let Some(session) = session {
                session.stop_connection();
            }
            drop(guard);
            connector.disconnecting.store(false, Ordering::SeqCst);

            if auto_reconnecting {
                let callback = connector
                    .auto_reconnect
                    .lock()
                    .expect("auto reconnect lock")
                    .clone();
                if let Some(callback) = callback {
                    if !connector.publisher.is_disposing() {
                        callback();
                    }
                }
            }
        });
        *self.disconnect_task.lock().expect("disconnect task lock") = Some(task);
    }

    /// Disconnect and wait for cleanup to finish.
    pub async fn disconnect(self: &Arc<Self>) {
        self.begin_disconnect(false);
        let task = self.disconnect_task.lock().expect("disconnect task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
