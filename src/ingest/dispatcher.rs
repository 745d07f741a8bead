//! Webhook ingestion: authenticate, normalise, persist, schedule.
//!
//! Everything up to and including the inbound message insert propagates as an
//! error so the channel redelivers. After the message is durable, failures are
//! logged and the webhook is still acknowledged; redeliveries are absorbed by
//! the provider-message-id dedupe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{
    ChannelCredentials, ChannelKind, InboundEvent, WebhookBatch, cloud_api, evolution,
};
use crate::error::{ChannelError, IngestError};
use crate::notify::Gateway;
use crate::pipeline::BatchJob;
use crate::queue::{JobQueue, JobSpec};
use crate::resolver::{ResolveRequest, Resolver};
use crate::sequence::SequenceScheduler;
use crate::store::model::{DeliveryStatus, NewMessage, SenderKind, Workspace};

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    Accepted { message_id: Uuid, conversation_id: Uuid },
    Duplicate,
}

/// Acknowledgement body for a webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

pub struct IngestDispatcher {
    gateway: Arc<Gateway>,
    resolver: Arc<Resolver>,
    scheduler: Arc<SequenceScheduler>,
    batch_queue: Arc<JobQueue>,
    debounce: Duration,
}

impl IngestDispatcher {
    pub fn new(
        gateway: Arc<Gateway>,
        resolver: Arc<Resolver>,
        scheduler: Arc<SequenceScheduler>,
        batch_queue: Arc<JobQueue>,
        debounce: Duration,
    ) -> Self {
        Self {
            gateway,
            resolver,
            scheduler,
            batch_queue,
            debounce,
        }
    }

    async fn workspace(&self, workspace_id: Uuid) -> Result<Workspace, IngestError> {
        self.gateway
            .db()
            .get_workspace(workspace_id)
            .await?
            .ok_or(IngestError::WorkspaceNotFound(workspace_id))
    }

    async fn credentials(
        &self,
        workspace_id: Uuid,
        channel: ChannelKind,
    ) -> Result<ChannelCredentials, IngestError> {
        self.gateway
            .db()
            .get_channel_credentials(workspace_id, channel)
            .await?
            .ok_or_else(|| {
                warn!(workspace_id = %workspace_id, channel = %channel, "Webhook for unconfigured channel");
                IngestError::Channel(ChannelError::MissingCredentials {
                    channel: channel.to_string(),
                    workspace_id,
                })
            })
    }

    /// Answer the Cloud API `GET` verification handshake.
    pub async fn verify_cloud_subscription(
        &self,
        workspace_id: Uuid,
        params: &HashMap<String, String>,
    ) -> Result<String, IngestError> {
        self.workspace(workspace_id).await?;
        let ChannelCredentials::CloudApi { verify_token, .. } =
            self.credentials(workspace_id, ChannelKind::CloudApi).await?
        else {
            return Err(IngestError::Unauthorized("credentials kind mismatch".into()));
        };
        cloud_api::verify_subscription(params, &verify_token)
            .ok_or_else(|| IngestError::Unauthorized("verify token mismatch".into()))
    }

    /// Handle a Cloud API `POST`. The signature is checked over the raw body.
    pub async fn handle_cloud_api(
        &self,
        workspace_id: Uuid,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestReport, IngestError> {
        let workspace = self.workspace(workspace_id).await?;
        let ChannelCredentials::CloudApi {
            phone_number_id,
            app_secret,
            ..
        } = self.credentials(workspace_id, ChannelKind::CloudApi).await?
        else {
            return Err(IngestError::Unauthorized("credentials kind mismatch".into()));
        };

        if !cloud_api::verify_signature(&app_secret, signature, body) {
            warn!(workspace_id = %workspace_id, "Cloud API signature mismatch");
            return Err(IngestError::Unauthorized("invalid signature".into()));
        }
        let payload: Value =
            serde_json::from_slice(body).map_err(|e| IngestError::Malformed(e.to_string()))?;

        let phone_number_id = Some(phone_number_id.as_str()).filter(|id| !id.is_empty());
        let batch = cloud_api::parse_webhook(&payload, phone_number_id);
        self.ingest_batch(&workspace, ChannelKind::CloudApi, batch).await
    }

    /// Handle an Evolution API `POST`. The key may arrive as an `apikey`
    /// header or inside the body and must match the stored one; only an
    /// instance stored without a key accepts unauthenticated calls.
    pub async fn handle_evolution(
        &self,
        workspace_id: Uuid,
        header_key: Option<&str>,
        payload: &Value,
    ) -> Result<IngestReport, IngestError> {
        let workspace = self.workspace(workspace_id).await?;
        let ChannelCredentials::Evolution { api_key, .. } =
            self.credentials(workspace_id, ChannelKind::Evolution).await?
        else {
            return Err(IngestError::Unauthorized("credentials kind mismatch".into()));
        };

        let presented = header_key.or_else(|| evolution::payload_api_key(payload));
        if !api_key.is_empty() {
            match presented {
                None => {
                    warn!(workspace_id = %workspace_id, "Evolution webhook without api key");
                    return Err(IngestError::Unauthorized("missing api key".into()));
                }
                Some(key) if key != api_key => {
                    warn!(workspace_id = %workspace_id, "Evolution api key mismatch");
                    return Err(IngestError::Unauthorized("invalid api key".into()));
                }
                Some(_) => {}
            }
        }
        if !payload.is_object() {
            return Err(IngestError::Malformed("expected a JSON object".into()));
        }

        let batch = evolution::parse_webhook(payload);
        self.ingest_batch(&workspace, ChannelKind::Evolution, batch).await
    }

    async fn ingest_batch(
        &self,
        workspace: &Workspace,
        channel: ChannelKind,
        batch: WebhookBatch,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport {
            ignored: batch.ignored,
            ..IngestReport::default()
        };
        for event in &batch.events {
            match self.ingest_event(workspace, channel, event).await? {
                IngestStatus::Accepted { .. } => report.accepted += 1,
                IngestStatus::Duplicate => report.duplicates += 1,
            }
        }
        if report.ignored > 0 && report.accepted == 0 {
            debug!(workspace_id = %workspace.id, channel = %channel, ignored = report.ignored, "Webhook had nothing to ingest");
        }
        Ok(report)
    }

    /// Resolve, persist and schedule one normalised inbound event.
    pub async fn ingest_event(
        &self,
        workspace: &Workspace,
        channel: ChannelKind,
        event: &InboundEvent,
    ) -> Result<IngestStatus, IngestError> {
        let now = self.gateway.now();
        let resolved = self
            .resolver
            .resolve(
                &ResolveRequest {
                    workspace_id: workspace.id,
                    phone_number: &event.phone_number,
                    display_name: event.display_name.as_deref(),
                    channel,
                    external_id: event.external_id.as_deref(),
                    metadata: None,
                    ai_enabled: workspace.ai_enabled_default,
                },
                now,
            )
            .await?;
        let conversation = &resolved.conversation;
        let client = &resolved.client;

        if resolved.conversation_created && !resolved.client_created {
            if let Some(open) = self
                .gateway
                .db()
                .open_follow_up(workspace.id, client.id)
                .await?
            {
                warn!(
                    client_id = %client.id,
                    follow_up_id = %open.id,
                    conversation_id = %conversation.id,
                    "New conversation while client has an open follow-up"
                );
            }
        }

        let mut metadata = Map::new();
        if let Some(ts) = event.provider_timestamp {
            metadata.insert("providerTimestamp".into(), json!(ts));
        }
        if let Some(media) = &event.media {
            metadata.insert("media".into(), json!(media));
        }
        let mut message = NewMessage::new(
            conversation.id,
            SenderKind::Client,
            event.content.as_str(),
            now,
            DeliveryStatus::Sent,
        );
        if let Some(id) = &event.provider_message_id {
            message = message.with_provider_id(id.as_str());
        }
        if !metadata.is_empty() {
            message = message.with_metadata(Value::Object(metadata));
        }

        let Some(stored) = self.gateway.record_message(workspace.id, &message).await? else {
            debug!(
                conversation_id = %conversation.id,
                provider_message_id = ?event.provider_message_id,
                "Duplicate inbound event"
            );
            return Ok(IngestStatus::Duplicate);
        };
        info!(
            conversation_id = %conversation.id,
            message_id = %stored.id,
            channel = %channel,
            "Inbound message stored"
        );

        // The message is durable: nothing below may fail the webhook.
        self.gateway
            .conversation_updated(conversation, resolved.conversation_created);
        if resolved.conversation_created {
            if let Err(e) = self
                .scheduler
                .start_follow_up(workspace.id, client.id, Some(conversation.id))
                .await
            {
                error!(client_id = %client.id, error = %e, "Failed to start follow-up");
            }
        }
        if let Err(e) = self.scheduler.cancel_cart_runs(conversation.id).await {
            error!(conversation_id = %conversation.id, error = %e, "Failed to cancel cart recovery");
        }

        let job = BatchJob {
            conversation_id: conversation.id,
            client_id: client.id,
            new_message_id: stored.id,
            workspace_id: workspace.id,
            received_at: stored.timestamp,
        };
        let enqueued = match JobSpec::new(job.job_id(), &job) {
            Ok(spec) => self.batch_queue.enqueue(spec.delayed(self.debounce)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = enqueued {
            error!(message_id = %stored.id, error = %e, "Failed to enqueue batch job");
        }

        Ok(IngestStatus::Accepted {
            message_id: stored.id,
            conversation_id: conversation.id,
        })
    }
}
