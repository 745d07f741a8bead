//! Per-channel webhook ingestion.

pub mod dispatcher;

pub use dispatcher::{IngestDispatcher, IngestReport, IngestStatus};
