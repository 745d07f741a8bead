//! Uniform send contract and inbound event shape shared by every backend.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// External messaging backend a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Meta's hosted WhatsApp Business Cloud API.
    #[serde(rename = "whatsapp_cloud")]
    CloudApi,
    /// Self-hosted Evolution API gateway.
    Evolution,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudApi => "whatsapp_cloud",
            Self::Evolution => "evolution",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp_cloud" | "cloud_api" => Ok(Self::CloudApi),
            "evolution" => Ok(Self::Evolution),
            other => Err(ChannelError::UnknownChannel(other.to_string())),
        }
    }
}

/// Per-workspace credentials for one channel.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelCredentials {
    #[serde(rename = "whatsapp_cloud")]
    CloudApi {
        phone_number_id: String,
        access_token: String,
        #[serde(default)]
        verify_token: String,
        #[serde(default)]
        app_secret: String,
    },
    Evolution {
        base_url: String,
        instance: String,
        api_key: String,
    },
}

impl ChannelCredentials {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::CloudApi { .. } => ChannelKind::CloudApi,
            Self::Evolution { .. } => ChannelKind::Evolution,
        }
    }
}

impl fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloudApi {
                phone_number_id, ..
            } => f
                .debug_struct("CloudApi")
                .field("phone_number_id", phone_number_id)
                .field("access_token", &"[REDACTED]")
                .finish_non_exhaustive(),
            Self::Evolution {
                base_url, instance, ..
            } => f
                .debug_struct("Evolution")
                .field("base_url", base_url)
                .field("instance", instance)
                .field("api_key", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// What to send. `text` doubles as the caption when media is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
        }
    }
}

/// Why a send did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// The provider answered with a structured error.
    ProviderRejected { status: u16, message: String },
    /// No usable response (connect error, timeout, unreadable body).
    Network(String),
    /// Missing or invalid local configuration; retrying cannot help.
    Configuration(String),
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderRejected { status, message } => {
                write!(f, "provider rejected ({status}): {message}")
            }
            Self::Network(reason) => write!(f, "network error: {reason}"),
            Self::Configuration(reason) => write!(f, "configuration error: {reason}"),
        }
    }
}

/// Normalized outcome of a send, identical for every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
            error: None,
        }
    }

    pub fn failed(failure: SendFailure) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(failure.to_string()),
        }
    }
}

/// Outbound side of a channel backend.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver `content` to `to`. Never errors: every failure is folded into
    /// the returned `SendResult` and the caller decides whether to retry.
    async fn send(
        &self,
        credentials: &ChannelCredentials,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult;
}

/// Media carried by an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMedia {
    pub kind: MediaKind,
    /// Provider media id or direct URL, whichever the payload exposes.
    pub reference: Option<String>,
    pub caption: Option<String>,
}

/// Canonical fields extracted from a customer-originated webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Digits only.
    pub phone_number: String,
    pub display_name: Option<String>,
    pub content: String,
    pub provider_message_id: Option<String>,
    pub provider_timestamp: Option<DateTime<Utc>>,
    /// Channel-native sender identifier (JID for Evolution, wa_id for Cloud API).
    pub external_id: Option<String>,
    pub media: Option<InboundMedia>,
}

/// Parsed webhook body: the events to ingest plus how many were filtered out.
#[derive(Debug, Clone, Default)]
pub struct WebhookBatch {
    pub events: Vec<InboundEvent>,
    pub ignored: usize,
}

/// Strip everything but ASCII digits. `None` when nothing is left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

/// Placeholder content for media-only inbound messages, e.g. `[image] caption`.
pub fn media_placeholder(kind: MediaKind, caption: Option<&str>) -> String {
    match caption.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("[{}] {}", kind.as_str(), caption),
        None => format!("[{}]", kind.as_str()),
    }
}

/// Picks the adapter for a conversation's stored channel.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind)
    }

    /// Send through the adapter registered for `channel`. Missing adapters or
    /// credentials surface as configuration failures, not errors.
    pub async fn send(
        &self,
        channel: ChannelKind,
        credentials: Option<&ChannelCredentials>,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult {
        let Some(adapter) = self.adapters.get(&channel) else {
            return SendResult::failed(SendFailure::Configuration(format!(
                "no adapter registered for {channel}"
            )));
        };
        let Some(credentials) = credentials else {
            return SendResult::failed(SendFailure::Configuration(format!(
                "missing {channel} credentials"
            )));
        };
        if credentials.kind() != channel {
            return SendResult::failed(SendFailure::Configuration(format!(
                "credentials are for {}, conversation is on {channel}",
                credentials.kind()
            )));
        }
        adapter.send(credentials, to, content).await
    }
}
