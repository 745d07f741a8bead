//! Debounce & batch coordinator.
//!
//! Every inbound message enqueues one batch job. After the debounce window a
//! job looks at the client messages newer than the latest AI message; only the
//! job whose message is the newest in that batch generates a reply, all others
//! skip. No lock is taken: the ownership check alone makes one job per burst
//! do the work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ai::{GenerationInput, GenerationOutcome, ResponseGenerator};
use crate::error::JobError;
use crate::notify::Gateway;
use crate::pipeline::outbound::Outbox;
use crate::queue::{JobHandler, JobOutcome, JobRecord};
use crate::store::model::SenderKind;

/// Payload of a batch-processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub conversation_id: Uuid,
    pub client_id: Uuid,
    pub new_message_id: Uuid,
    pub workspace_id: Uuid,
    pub received_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn job_id(&self) -> String {
        format!("batch_{}", self.new_message_id)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Buffer after `received_at` that lets a burst settle.
    pub debounce: Duration,
    /// Messages of history handed to the generator.
    pub history_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(3000),
            history_window: 20,
        }
    }
}

pub struct BatchCoordinator {
    gateway: Arc<Gateway>,
    generator: Arc<ResponseGenerator>,
    outbox: Arc<Outbox>,
    config: CoordinatorConfig,
}

impl BatchCoordinator {
    pub fn new(
        gateway: Arc<Gateway>,
        generator: Arc<ResponseGenerator>,
        outbox: Arc<Outbox>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            gateway,
            generator,
            outbox,
            config,
        }
    }

    /// Time still left in the debounce window for `job`, by the injected clock.
    fn remaining_debounce(&self, job: &BatchJob) -> Duration {
        let settle_at = job.received_at
            + chrono::Duration::from_std(self.config.debounce).unwrap_or_else(|_| chrono::Duration::zero());
        (settle_at - self.gateway.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.config.debounce)
    }

    pub async fn process(&self, job: &BatchJob) -> Result<JobOutcome, JobError> {
        let wait = self.remaining_debounce(job);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let db = self.gateway.db();
        let conversation = db
            .get_conversation(job.conversation_id)
            .await?
            .ok_or_else(|| JobError::retryable(format!("conversation {} not found", job.conversation_id)))?;

        if !conversation.ai_enabled {
            return Ok(JobOutcome::Skipped("ai disabled for conversation".into()));
        }

        let since = db
            .latest_message_cursor(conversation.id, SenderKind::Ai)
            .await?;
        let batch = db.client_messages_after(conversation.id, since).await?;

        let Some(newest) = batch.last() else {
            return Ok(JobOutcome::Skipped("no pending client messages".into()));
        };
        if newest.id != job.new_message_id {
            debug!(
                conversation_id = %conversation.id,
                message_id = %job.new_message_id,
                owner = %newest.id,
                batch = batch.len(),
                "Batch owned by a newer message"
            );
            return Ok(JobOutcome::Skipped(format!("superseded by message {}", newest.id)));
        }

        let workspace = db
            .get_workspace(job.workspace_id)
            .await?
            .ok_or_else(|| JobError::retryable(format!("workspace {} not found", job.workspace_id)))?;
        let client = db
            .get_client(conversation.client_id)
            .await?
            .ok_or_else(|| JobError::retryable(format!("client {} not found", conversation.client_id)))?;
        let history = db
            .recent_messages(conversation.id, self.config.history_window)
            .await?;
        let stages = db.list_active_stages(workspace.id).await?;

        info!(
            conversation_id = %conversation.id,
            batch = batch.len(),
            history = history.len(),
            "Generating reply"
        );
        let generation = self
            .generator
            .generate(GenerationInput {
                workspace: &workspace,
                conversation_id: conversation.id,
                history: &history,
                stages: &stages,
                context: &conversation.context,
            })
            .await?;

        if let Some(context) = &generation.context {
            db.update_conversation_context(conversation.id, context)
                .await?;
        }

        let (text, metadata) = match generation.outcome {
            GenerationOutcome::Reply(text) => (text, None),
            GenerationOutcome::MissingData { stage, fields } => {
                let question = self
                    .generator
                    .ask_for_missing(&workspace, &history, &stage, &fields)
                    .await;
                (
                    question,
                    Some(json!({ "missingData": { "stage": stage, "fields": fields } })),
                )
            }
            GenerationOutcome::ToolOnly => {
                info!(conversation_id = %conversation.id, "Tool-only outcome, nothing to send");
                return Ok(JobOutcome::Completed);
            }
        };

        let message = self
            .outbox
            .deliver(&conversation, &client, &text, metadata)
            .await?;
        info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            status = %message.status,
            "Reply processed"
        );
        Ok(JobOutcome::Completed)
    }
}

#[async_trait]
impl JobHandler for BatchCoordinator {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, JobError> {
        let payload: BatchJob = job.payload_as()?;
        self.process(&payload).await
    }
}
