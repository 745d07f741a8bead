//! Outbound delivery shared by the batch coordinator and the sequence scheduler.

use std::sync::Arc;

use tracing::debug;

use crate::channels::{ChannelRouter, OutboundContent};
use crate::error::DatabaseError;
use crate::notify::Gateway;
use crate::store::model::{Client, Conversation, DeliveryStatus, Message, NewMessage, SenderKind};

pub struct Outbox {
    gateway: Arc<Gateway>,
    router: Arc<ChannelRouter>,
}

impl Outbox {
    pub fn new(gateway: Arc<Gateway>, router: Arc<ChannelRouter>) -> Self {
        Self { gateway, router }
    }

    /// Persist an AI message as `PENDING`, send it on the conversation's
    /// channel and record the outcome. A failed send is data on the message,
    /// never an error; only storage failures propagate.
    pub async fn deliver(
        &self,
        conversation: &Conversation,
        client: &Client,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message, DatabaseError> {
        let mut pending = NewMessage::new(
            conversation.id,
            SenderKind::Ai,
            text,
            self.gateway.now(),
            DeliveryStatus::Pending,
        );
        if let Some(metadata) = metadata {
            pending = pending.with_metadata(metadata);
        }

        let message = self
            .gateway
            .record_message(conversation.workspace_id, &pending)
            .await?
            .ok_or_else(|| {
                DatabaseError::Constraint(format!(
                    "outbound message rejected for conversation {}",
                    conversation.id
                ))
            })?;
        self.gateway.touch_conversation(conversation).await?;

        let credentials = self
            .gateway
            .db()
            .get_channel_credentials(conversation.workspace_id, conversation.channel)
            .await?;
        debug!(
            message_id = %message.id,
            channel = %conversation.channel,
            "Sending outbound message"
        );
        let result = self
            .router
            .send(
                conversation.channel,
                credentials.as_ref(),
                &client.phone_number,
                &OutboundContent::text(text),
            )
            .await;

        self.gateway
            .record_delivery(conversation.workspace_id, &message, &result)
            .await
    }
}
