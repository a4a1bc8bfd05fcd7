//! Measurement routing tables.
//!
//! Shared across sessions and read-mostly: `update_routes` replaces a
//! session's signal set when its signal index cache swaps in, and `publish`
//! fans a measurement batch out to every session routed for the signals it
//! carries. Batch order is preserved per session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use gridpulse_wire::Measurement;
use uuid::Uuid;

use crate::transport::session::SubscriberSession;

#[derive(Default)]
pub struct RoutingTables {
    // Signal id to subscriber instance ids.
    routes: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    // Instance id to live session handle.
    destinations: RwLock<HashMap<Uuid, Arc<SubscriberSession>>>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the routed signal set for one session.
    pub fn update_routes(&self, session: &Arc<SubscriberSession>, signal_ids: &[Uuid]) {
        let instance_id = session.instance_id();
        {
            let mut destinations = self.destinations.write().expect("destinations lock");
            destinations.insert(instance_id, Arc::clone(session));
        }
        let mut routes = self.routes.write().expect("routes lock");
        routes.retain(|_, subscribers| {
            subscribers.remove(&instance_id);
            !subscribers.is_empty()
        });
        for signal_id in signal_ids {
            routes.entry(*signal_id).or_default().insert(instance_id);
        }
    }

    pub fn remove_session(&self, instance_id: &Uuid) {
        {
            let mut routes = self.routes.write().expect("routes lock");
            routes.retain(|_, subscribers| {
                subscribers.remove(instance_id);
                !subscribers.is_empty()
            });
        }
        self.destinations
            .write()
            .expect("destinations lock")
            .remove(instance_id);
    }

    /// Fan a measurement batch out to each routed session.
    pub fn publish(&self, measurements: &[Measurement]) {
        let mut batches: HashMap<Uuid, Vec<Measurement>> = HashMap::new();
        {
            let routes = self.routes.read().expect("routes lock");
            for measurement in measurements {
                if let Some(subscribers) = routes.get(&measurement.signal_id) {
                    for instance_id in subscribers {
                        batches.entry(*instance_id).or_default().push(*measurement);
                    }
                }
            }
        }
        if batches.is_empty() {
            return;
        }
        let destinations = self.destinations.read().expect("destinations lock");
        for (instance_id, batch) in batches {
            if let Some(session) = destinations.get(&instance_id) {
                session.publish_measurements(&batch);
            }
        }
    }

    pub fn routed_signal_count(&self) -> usize {
        self.routes.read().expect("routes lock").len()
    }
}
