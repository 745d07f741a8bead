//! Persistent entities: workspaces, clients, conversations, messages.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::ChannelKind;

/// Tenant boundary. Owns credentials, rules, stages and every client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    /// Base system prompt for AI replies.
    pub system_prompt: String,
    /// Whether newly created conversations start with AI replies enabled.
    pub ai_enabled_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            ai_enabled_default: true,
            created_at: Utc::now(),
        }
    }
}

/// An end customer within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub channel: ChannelKind,
    /// Channel-native identifier (e.g. a WhatsApp JID).
    pub external_id: Option<String>,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Stage/tool state carried on a conversation.
///
/// Unknown keys written by stage actions are kept in `extra` so a round trip
/// through this struct never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub collected_data: BTreeMap<String, String>,
    #[serde(default)]
    pub stage_history: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConversationContext {
    /// Parse from the stored JSON column, falling back to empty on garbage.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn enter_stage(&mut self, stage: &str) {
        self.current_stage = Some(stage.to_string());
        if self.stage_history.last().map(String::as_str) != Some(stage) {
            self.stage_history.push(stage.to_string());
        }
    }
}

/// One thread between a client and a workspace on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub client_id: Uuid,
    pub channel: ChannelKind,
    pub status: ConversationStatus,
    pub ai_enabled: bool,
    pub last_activity_at: DateTime<Utc>,
    pub external_thread_id: Option<String>,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderKind {
    Client,
    Ai,
    Agent,
    System,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Ai => "ai",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl FromStr for SenderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "ai" => Ok(Self::Ai),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown sender kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event in a conversation. Only delivery fields change after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: SenderKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Position of a message in its conversation's total order: timestamp, then
/// insertion sequence for equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
}

/// Insert request for a message. The store assigns the id and clamps the
/// timestamp so it never precedes the conversation's latest message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender: SenderKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn new(
        conversation_id: Uuid,
        sender: SenderKind,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        status: DeliveryStatus,
    ) -> Self {
        Self {
            conversation_id,
            sender,
            content: content.into(),
            timestamp,
            status,
            provider_message_id: None,
            metadata: None,
        }
    }

    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
