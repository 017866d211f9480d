//! Bridge between the relay and the management endpoint.

pub mod discovery;
pub mod session;

pub use discovery::DiscoveryPolicy;
pub use session::{BridgeSession, BridgeSettings};
