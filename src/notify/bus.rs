//! In-process notification bus: broadcast fan-out to live UI subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::sequence::model::{SequenceFamily, SequenceStatus};
use crate::store::model::{ConversationStatus, DeliveryStatus, Message, SenderKind};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Event payloads published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    NewMessage {
        id: Uuid,
        conversation_id: Uuid,
        sender_kind: SenderKind,
        content: String,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    },
    MessageStatusUpdate {
        id: Uuid,
        conversation_id: Uuid,
        status: DeliveryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConversationUpdated {
        id: Uuid,
        client_id: Uuid,
        status: ConversationStatus,
        ai_enabled: bool,
        last_activity_at: DateTime<Utc>,
        created: bool,
    },
    SequenceUpdated {
        id: Uuid,
        family: SequenceFamily,
        status: SequenceStatus,
        current_step: i64,
    },
}

impl EventKind {
    pub fn new_message(message: &Message) -> Self {
        Self::NewMessage {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_kind: message.sender,
            content: message.content.clone(),
            status: message.status,
            timestamp: message.timestamp,
        }
    }
}

/// A bus event scoped to the workspace it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub workspace_id: Uuid,
    #[serde(flatten)]
    pub event: EventKind,
}

/// Broadcast bus. Publishing with no subscribers is not an error.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, workspace_id: Uuid, event: EventKind) {
        let receivers = self
            .tx
            .send(Notification {
                workspace_id,
                event,
            })
            .unwrap_or(0);
        trace!(workspace_id = %workspace_id, receivers, "Notification published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = NotificationBus::new();
        bus.publish(
            Uuid::new_v4(),
            EventKind::SequenceUpdated {
                id: Uuid::new_v4(),
                family: SequenceFamily::FollowUp,
                status: SequenceStatus::Active,
                current_step: 0,
            },
        );
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        bus.publish(
            ws,
            EventKind::MessageStatusUpdate {
                id,
                conversation_id: Uuid::new_v4(),
                status: DeliveryStatus::Sent,
                provider_message_id: Some("wamid.1".into()),
                error: None,
            },
        );

        let got = rx.recv().await.unwrap();
        assert_eq!(got.workspace_id, ws);
        assert!(matches!(got.event, EventKind::MessageStatusUpdate { id: got_id, .. } if got_id == id));
    }

    #[test]
    fn wire_shape_is_flat_and_camel_case() {
        let note = Notification {
            workspace_id: Uuid::nil(),
            event: EventKind::SequenceUpdated {
                id: Uuid::nil(),
                family: SequenceFamily::AbandonedCart,
                status: SequenceStatus::Cancelled,
                current_step: 2,
            },
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["type"], "sequence_updated");
        assert_eq!(json["workspaceId"], Uuid::nil().to_string());
        assert_eq!(json["currentStep"], 2);
        assert_eq!(json["status"], "CANCELLED");
        assert_eq!(json["family"], "abandoned_cart");
    }
}
