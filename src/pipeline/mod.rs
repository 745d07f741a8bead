//! Inbound reply pipeline.
//!
//! A client message is stored, then a debounced batch job per message is
//! queued. When the jobs of a burst fire, only the one owning the newest
//! message generates a reply; the rest skip.

pub mod coordinator;
pub mod outbound;

pub use coordinator::{BatchCoordinator, BatchJob, CoordinatorConfig};
pub use outbound::Outbox;
