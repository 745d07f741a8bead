//! Persistence & notification gateway.
//!
//! Every durable write made through the gateway is followed by the matching
//! bus event. Storage stays the source of truth: a failed write returns an
//! error and publishes nothing, a successful write always publishes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::SendResult;
use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::notify::bus::{EventKind, NotificationBus};
use crate::sequence::model::SequenceRun;
use crate::store::Database;
use crate::store::model::{Conversation, DeliveryStatus, Message, NewMessage};

pub struct Gateway {
    db: Arc<dyn Database>,
    bus: Arc<NotificationBus>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(db: Arc<dyn Database>, bus: Arc<NotificationBus>, clock: Arc<dyn Clock>) -> Self {
        Self { db, bus, clock }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Append a message and announce it. `None` means the store rejected it as
    /// a duplicate inbound event; nothing is published in that case.
    pub async fn record_message(
        &self,
        workspace_id: Uuid,
        message: &NewMessage,
    ) -> Result<Option<Message>, DatabaseError> {
        let Some(stored) = self.db.insert_message(message).await? else {
            return Ok(None);
        };
        debug!(
            message_id = %stored.id,
            conversation_id = %stored.conversation_id,
            sender = stored.sender.as_str(),
            "Message persisted"
        );
        self.bus
            .publish(workspace_id, EventKind::new_message(&stored));
        Ok(Some(stored))
    }

    /// Apply a channel send result to a pending outbound message.
    pub async fn record_delivery(
        &self,
        workspace_id: Uuid,
        message: &Message,
        result: &SendResult,
    ) -> Result<Message, DatabaseError> {
        let status = if result.success {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        self.db
            .update_message_delivery(
                message.id,
                status,
                result.provider_message_id.as_deref(),
                result.error.as_deref(),
            )
            .await?;

        if result.success {
            info!(message_id = %message.id, provider_message_id = ?result.provider_message_id, "Message delivered");
        } else {
            warn!(message_id = %message.id, error = ?result.error, "Message delivery failed");
        }

        self.bus.publish(
            workspace_id,
            EventKind::MessageStatusUpdate {
                id: message.id,
                conversation_id: message.conversation_id,
                status,
                provider_message_id: result.provider_message_id.clone(),
                error: result.error.clone(),
            },
        );

        let mut updated = message.clone();
        updated.status = status;
        if result.provider_message_id.is_some() {
            updated.provider_message_id = result.provider_message_id.clone();
        }
        updated.error = result.error.clone();
        Ok(updated)
    }

    /// Refresh last activity and announce the conversation.
    pub async fn touch_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError> {
        let now = self.now();
        self.db.touch_conversation(conversation.id, now).await?;
        let mut touched = conversation.clone();
        touched.last_activity_at = touched.last_activity_at.max(now);
        self.conversation_updated(&touched, false);
        Ok(())
    }

    pub fn conversation_updated(&self, conversation: &Conversation, created: bool) {
        self.bus.publish(
            conversation.workspace_id,
            EventKind::ConversationUpdated {
                id: conversation.id,
                client_id: conversation.client_id,
                status: conversation.status,
                ai_enabled: conversation.ai_enabled,
                last_activity_at: conversation.last_activity_at,
                created,
            },
        );
    }

    pub fn sequence_updated(&self, run: &SequenceRun) {
        self.bus.publish(
            run.workspace_id,
            EventKind::SequenceUpdated {
                id: run.id,
                family: run.family,
                status: run.status,
                current_step: run.current_step,
            },
        );
    }
}
