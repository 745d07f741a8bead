//! Error types for the follow-up engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Channel-related errors (inbound side; outbound failures travel in `SendResult`).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("No adapter registered for channel {0}")]
    NoAdapter(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Missing credentials for channel {channel} in workspace {workspace_id}")]
    MissingCredentials { channel: String, workspace_id: Uuid },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to serialize job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Error returned by a job handler.
///
/// `retryable = false` short-circuits the backoff policy and marks the job
/// failed immediately.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct JobError {
    pub reason: String,
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<DatabaseError> for JobError {
    fn from(e: DatabaseError) -> Self {
        Self::retryable(e.to_string())
    }
}

impl From<LlmError> for JobError {
    fn from(e: LlmError) -> Self {
        Self::retryable(e.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        Self::retryable(e.to_string())
    }
}

impl From<SequenceError> for JobError {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::Database(db) => Self::retryable(db.to_string()),
            SequenceError::Queue(q) => Self::retryable(q.to_string()),
            SequenceError::NotFound(id) => Self::retryable(format!("sequence run {id} not found")),
            other => Self::fatal(other.to_string()),
        }
    }
}

/// Webhook ingestion errors. The HTTP layer maps these onto status codes.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Workspace {0} not found")]
    WorkspaceNotFound(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Sequence scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("Sequence run {0} not found")]
    NotFound(Uuid),

    #[error("Sequence run {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
