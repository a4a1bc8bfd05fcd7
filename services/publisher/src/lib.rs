// Publisher service library: configuration, the publisher container, and the
// per-subscriber transport session implementing the streaming protocol.
pub mod config;
pub mod observability;
pub mod publisher;
pub mod routing;
pub mod transport;

pub use publisher::{Publisher, PublisherEvent};
pub use transport::session::SubscriberSession;
