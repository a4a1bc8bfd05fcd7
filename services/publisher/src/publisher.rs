//! Publisher container.
//!
//! Owns the pieces shared across subscriber sessions: policy configuration,
//! the metadata dataset, the measurement routing tables, and the session
//! registry. Session callbacks surface as tagged [`PublisherEvent`]s on an
//! unbounded channel rather than through inheritance, so embedding
//! applications consume one stream of notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use gridpulse_metadata::MetadataSet;
use gridpulse_wire::Measurement;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::PublisherConfig;
use crate::routing::RoutingTables;
use crate::transport::session::SubscriberSession;

#[derive(Debug, Clone)]
pub enum PublisherEvent {
    TemporalSubscriptionRequested { instance_id: Uuid },
    TemporalSubscriptionCanceled { instance_id: Uuid },
    ProcessingIntervalChangeRequested { instance_id: Uuid, interval: i32 },
    UserCommand { instance_id: Uuid, command: u8, payload: Vec<u8> },
    ConnectionTerminated { instance_id: Uuid },
}

pub struct Publisher {
    config: PublisherConfig,
    node_id: Uuid,
    metadata: RwLock<Arc<MetadataSet>>,
    routing: RoutingTables,
    sessions: DashMap<Uuid, Arc<SubscriberSession>>,
    events: mpsc::UnboundedSender<PublisherEvent>,
    disposing: AtomicBool,
    reverse_connection: AtomicBool,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PublisherEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let publisher = Arc::new(Self {
            config,
            node_id: Uuid::new_v4(),
            metadata: RwLock::new(Arc::new(MetadataSet::new())),
            routing: RoutingTables::new(),
            sessions: DashMap::new(),
            events,
            disposing: AtomicBool::new(false),
            reverse_connection: AtomicBool::new(false),
        });
        (publisher, receiver)
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn set_metadata(&self, metadata: MetadataSet) {
        *self.metadata.write().expect("metadata lock") = Arc::new(metadata);
    }

    pub fn metadata(&self) -> Arc<MetadataSet> {
        Arc::clone(&self.metadata.read().expect("metadata lock"))
    }

    pub fn routing(&self) -> &RoutingTables {
        &self.routing
    }

    pub fn is_nan_value_filter_allowed(&self) -> bool {
        self.config.allow_nan_value_filter
    }

    pub fn is_nan_value_filter_forced(&self) -> bool {
        self.config.force_nan_value_filter
    }

    pub fn supports_temporal_subscriptions(&self) -> bool {
        self.config.allow_temporal_subscriptions
    }

    pub fn is_metadata_refresh_allowed(&self) -> bool {
        self.config.allow_metadata_refresh
    }

    pub fn use_base_time_offsets(&self) -> bool {
        self.config.use_base_time_offsets
    }

    pub fn dispatch(&self, event: PublisherEvent) {
        // Receiver may be gone during shutdown; events are advisory.
        let _ = self.events.send(event);
    }

    pub fn register_session(&self, session: Arc<SubscriberSession>) {
        self.sessions.insert(session.instance_id(), session);
    }

    pub fn session(&self, instance_id: &Uuid) -> Option<Arc<SubscriberSession>> {
        self.sessions
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver a batch of measurements to every routed subscriber.
    pub fn publish_measurements(&self, measurements: &[Measurement]) {
        self.routing.publish(measurements);
    }

    /// Called by a session once it has fully stopped.
    pub fn connection_terminated(&self, session: &SubscriberSession) {
        let instance_id = session.instance_id();
        self.sessions.remove(&instance_id);
        self.routing.remove_session(&instance_id);
        self.dispatch(PublisherEvent::ConnectionTerminated { instance_id });
    }

    pub fn set_reverse_connection(&self, reverse: bool) {
        self.reverse_connection.store(reverse, Ordering::SeqCst);
    }

    pub fn is_reverse_connection(&self) -> bool {
        self.reverse_connection.load(Ordering::SeqCst)
    }

    pub fn set_disposing(&self) {
        self.disposing.store(true, Ordering::SeqCst);
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }
}
