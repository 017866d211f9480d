//! In-memory connection registry: agent management connections, viewer
//! subscriptions and notification fan-out.

mod hub;
mod management;
mod viewer;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use hub::{ConnectionHub, HubSettings};
pub use management::ManagementConnection;
pub use viewer::ViewerConnection;
