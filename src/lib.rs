//! Follow-up engine: debounced AI replies and timed follow-up sequences for
//! WhatsApp conversations.

pub mod ai;
pub mod app;
pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod resolver;
pub mod sequence;
pub mod store;

#[cfg(test)]
mod testing;
