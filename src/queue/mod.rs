//! Durable job queues and their worker pools.

pub mod job;
pub mod worker;

pub use job::{
    JobHandler, JobOutcome, JobQueue, JobRecord, JobSpec, JobStatus, ProcessedJob, QueuePolicy,
};
pub use worker::WorkerPool;

/// Queue carrying debounced inbound batch jobs.
pub const BATCH_QUEUE: &str = "batch";
/// Queue carrying delayed sequence steps.
pub const SEQUENCE_QUEUE: &str = "sequence";
