pub mod connection;
pub mod dispatch;
pub mod events;
pub mod hub;
pub mod registry;
pub mod server;

pub use hub::{Hub, HubError, HubHandle};
pub use registry::{Group, Target};
