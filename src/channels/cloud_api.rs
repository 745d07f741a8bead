//! WhatsApp Business Cloud API backend.
//!
//! Outbound goes to the Graph `/{phone_number_id}/messages` endpoint with a
//! bearer token. Inbound webhooks are signed with the app secret
//! (`X-Hub-Signature-256`) and carry `entry[].changes[].value.messages[]`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::channels::channel::{
    ChannelAdapter, ChannelCredentials, ChannelKind, InboundEvent, InboundMedia, MediaKind,
    OutboundContent, SendFailure, SendResult, WebhookBatch, media_placeholder, normalize_phone,
};

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v21.0";

pub struct CloudApiAdapter {
    client: reqwest::Client,
    graph_base: String,
}

impl CloudApiAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base(DEFAULT_GRAPH_BASE, timeout)
    }

    /// Point at a different Graph host (used by tests to hit a local stub).
    pub fn with_base(graph_base: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            graph_base: graph_base.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Build the Graph API message payload.
fn build_payload(to: &str, content: &OutboundContent) -> Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });

    match &content.media {
        Some(media) => {
            let kind = media.kind.as_str();
            payload["type"] = json!(kind);
            let mut body = json!({ "link": media.url });
            match media.kind {
                // Audio has no caption field.
                MediaKind::Audio => {}
                MediaKind::Document => {
                    body["caption"] = json!(content.text);
                    body["filename"] =
                        json!(media.filename.as_deref().unwrap_or("attachment"));
                }
                MediaKind::Image | MediaKind::Video => {
                    body["caption"] = json!(content.text);
                }
            }
            payload[kind] = body;
        }
        None => {
            payload["type"] = json!("text");
            payload["text"] = json!({ "preview_url": false, "body": content.text });
        }
    }
    payload
}

#[async_trait]
impl ChannelAdapter for CloudApiAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::CloudApi
    }

    async fn send(
        &self,
        credentials: &ChannelCredentials,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult {
        let ChannelCredentials::CloudApi {
            phone_number_id,
            access_token,
            ..
        } = credentials
        else {
            return SendResult::failed(SendFailure::Configuration(
                "cloud api adapter given non cloud api credentials".into(),
            ));
        };
        if phone_number_id.is_empty() || access_token.is_empty() {
            return SendResult::failed(SendFailure::Configuration(
                "missing whatsapp accessToken or phoneNumberId".into(),
            ));
        }
        let Some(to) = normalize_phone(to) else {
            return SendResult::failed(SendFailure::Configuration(format!(
                "invalid recipient phone: {to}"
            )));
        };

        let url = format!("{}/{}/messages", self.graph_base, phone_number_id);
        let response = match self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&build_payload(&to, content))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return SendResult::failed(SendFailure::Network(e.to_string())),
        };

        let status = response.status();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => return SendResult::failed(SendFailure::Network(e.to_string())),
        };
        let body: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "raw": raw }));

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw.chars().take(300).collect());
            tracing::warn!(status = status.as_u16(), error = %message, "Cloud API rejected message");
            return SendResult::failed(SendFailure::ProviderRejected {
                status: status.as_u16(),
                message,
            });
        }

        let id = body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        SendResult::sent(id)
    }
}

/// Answer the subscription handshake. Returns the challenge to echo on success.
pub fn verify_subscription(
    params: &HashMap<String, String>,
    expected_token: &str,
) -> Option<String> {
    let mode = params.get("hub.mode").map(String::as_str)?;
    let token = params.get("hub.verify_token").map(String::as_str)?;
    if mode != "subscribe" || expected_token.is_empty() || token != expected_token {
        return None;
    }
    params.get("hub.challenge").cloned()
}

/// Check `X-Hub-Signature-256` against the raw request body.
/// An empty app secret disables verification.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Content of a single inbound message, or `None` for unsupported types.
fn message_content(message: &Value) -> Option<(String, Option<InboundMedia>)> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    let text = match msg_type.as_str() {
        "text" => str_at(message, "/text/body"),
        "button" => str_at(message, "/button/text"),
        "interactive" => str_at(message, "/interactive/button_reply/title")
            .or_else(|| str_at(message, "/interactive/list_reply/title")),
        _ => None,
    };
    if let Some(text) = text {
        return Some((text.to_string(), None));
    }

    let kind = match msg_type.as_str() {
        "image" | "sticker" => MediaKind::Image,
        "audio" | "voice" => MediaKind::Audio,
        "video" => MediaKind::Video,
        "document" => MediaKind::Document,
        _ => return None,
    };
    let node = message.get(msg_type.as_str())?;
    let caption = str_at(node, "/caption").map(str::to_string);
    let media = InboundMedia {
        kind,
        reference: str_at(node, "/id").map(str::to_string),
        caption: caption.clone(),
    };
    Some((media_placeholder(kind, caption.as_deref()), Some(media)))
}

fn contact_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for contact in value
        .get("contacts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(wa_id) = contact.get("wa_id").and_then(Value::as_str) else {
            continue;
        };
        let Some(name) = str_at(contact, "/profile/name") else {
            continue;
        };
        if let Some(digits) = normalize_phone(wa_id) {
            names.insert(digits, name.to_string());
        }
    }
    names
}

/// Extract customer messages from a webhook body.
///
/// Status callbacks, unsupported message types, and changes addressed to a
/// different `phone_number_id` are counted in `ignored`.
pub fn parse_webhook(payload: &Value, phone_number_id: Option<&str>) -> WebhookBatch {
    let mut batch = WebhookBatch::default();

    let changes = payload
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("changes").and_then(Value::as_array))
        .flatten();

    for change in changes {
        let Some(value) = change.get("value") else {
            batch.ignored += 1;
            continue;
        };
        let addressed_to = str_at(value, "/metadata/phone_number_id");
        if matches!((phone_number_id, addressed_to), (Some(expected), Some(actual)) if expected != actual)
        {
            batch.ignored += 1;
            continue;
        }

        let statuses = value
            .get("statuses")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        batch.ignored += statuses;

        let names = contact_names(value);
        for message in value
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(phone) = message
                .get("from")
                .and_then(Value::as_str)
                .and_then(normalize_phone)
            else {
                batch.ignored += 1;
                continue;
            };
            let Some((content, media)) = message_content(message) else {
                batch.ignored += 1;
                continue;
            };
            let provider_timestamp = message
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

            batch.events.push(InboundEvent {
                display_name: names.get(&phone).cloned(),
                external_id: Some(phone.clone()),
                phone_number: phone,
                content,
                provider_message_id: str_at(message, "/id").map(str::to_string),
                provider_timestamp,
                media,
            });
        }
    }
    batch
}
