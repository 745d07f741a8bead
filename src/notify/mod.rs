//! Live notifications: the broadcast bus and the write-then-publish gateway.

pub mod bus;
pub mod gateway;

pub use bus::{EventKind, Notification, NotificationBus};
pub use gateway::Gateway;
