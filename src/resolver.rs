//! Client/conversation resolver.
//!
//! Both lookups are unique-constraint-backed upserts, so concurrent calls for
//! the same key converge on the same rows and exactly one caller observes
//! `created = true`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::error::DatabaseError;
use crate::store::model::{Client, Conversation};
use crate::store::{ClientUpsert, Database};

/// Inputs for one resolve call.
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub workspace_id: Uuid,
    pub phone_number: &'a str,
    pub display_name: Option<&'a str>,
    pub channel: ChannelKind,
    pub external_id: Option<&'a str>,
    pub metadata: Option<&'a serde_json::Value>,
    /// AI flag for a conversation created by this call.
    pub ai_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub client: Client,
    pub conversation: Conversation,
    pub conversation_created: bool,
    pub client_created: bool,
}

pub struct Resolver {
    db: Arc<dyn Database>,
}

impl Resolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn resolve(
        &self,
        request: &ResolveRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Resolved, DatabaseError> {
        let (client, client_created) = self
            .db
            .upsert_client(
                &ClientUpsert {
                    workspace_id: request.workspace_id,
                    phone_number: request.phone_number,
                    channel: request.channel,
                    display_name: request.display_name,
                    external_id: request.external_id,
                    metadata: request.metadata,
                },
                now,
            )
            .await?;

        let (conversation, conversation_created) = self
            .db
            .upsert_conversation(
                request.workspace_id,
                client.id,
                request.channel,
                request.ai_enabled,
                now,
            )
            .await?;

        debug!(
            client_id = %client.id,
            conversation_id = %conversation.id,
            client_created,
            conversation_created,
            "Resolved conversation"
        );

        Ok(Resolved {
            client,
            conversation,
            conversation_created,
            client_created,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::store::model::{ConversationStatus, Workspace};

    fn request(ws: Uuid, phone: &str) -> ResolveRequest<'_> {
        ResolveRequest {
            workspace_id: ws,
            phone_number: phone,
            display_name: Some("Ana"),
            channel: ChannelKind::CloudApi,
            external_id: None,
            metadata: None,
            ai_enabled: true,
        }
    }

    #[tokio::test]
    async fn concurrent_resolves_converge() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ws = Workspace::new("Acme", "");
        db.upsert_workspace(&ws).await.unwrap();
        let resolver = Arc::new(Resolver::new(db));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            let ws_id = ws.id;
            handles.push(tokio::spawn(async move {
                resolver.resolve(&request(ws_id, "5511999"), now).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        let conv_id = results[0].conversation.id;
        assert!(results.iter().all(|r| r.conversation.id == conv_id));
        assert_eq!(results.iter().filter(|r| r.conversation_created).count(), 1);
        assert_eq!(results.iter().filter(|r| r.client_created).count(), 1);
    }

    #[tokio::test]
    async fn closed_conversation_reopens() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ws = Workspace::new("Acme", "");
        db.upsert_workspace(&ws).await.unwrap();
        let resolver = Resolver::new(Arc::clone(&db));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

        let first = resolver.resolve(&request(ws.id, "1"), now).await.unwrap();
        db.close_conversation(first.conversation.id).await.unwrap();

        let second = resolver
            .resolve(&request(ws.id, "1"), now + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(!second.conversation_created);
        assert!(!second.client_created);
        assert_eq!(second.conversation.id, first.conversation.id);
        assert_eq!(second.conversation.status, ConversationStatus::Active);
    }
}
