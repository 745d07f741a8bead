//! Evolution API backend (self-hosted WhatsApp Web gateway).
//!
//! Outbound: `POST {base}/message/sendText/{instance}` or `sendMedia`, authed
//! with an `apikey` header. Inbound: `messages.upsert` events keyed by JID.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use crate::channels::channel::{
    ChannelAdapter, ChannelCredentials, ChannelKind, InboundEvent, InboundMedia, MediaKind,
    OutboundContent, SendFailure, SendResult, WebhookBatch, media_placeholder, normalize_phone,
};

pub struct EvolutionAdapter {
    client: reqwest::Client,
}

impl EvolutionAdapter {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

fn send_request(instance: &str, to: &str, content: &OutboundContent) -> (String, Value) {
    match &content.media {
        Some(media) => {
            let mut body = json!({
                "number": to,
                "mediatype": media.kind.as_str(),
                "media": media.url,
                "caption": content.text,
            });
            if let Some(name) = &media.filename {
                body["fileName"] = json!(name);
            }
            (format!("message/sendMedia/{instance}"), body)
        }
        None => (
            format!("message/sendText/{instance}"),
            json!({ "number": to, "text": content.text }),
        ),
    }
}

/// Evolution reports errors as `response.message` (string or list) or a bare `message`.
fn error_message(body: &Value) -> Option<String> {
    let node = body
        .pointer("/response/message")
        .or_else(|| body.get("message"))
        .or_else(|| body.get("error"))?;
    match node {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            if parts.is_empty() { None } else { Some(parts.join("; ")) }
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ChannelAdapter for EvolutionAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Evolution
    }

    async fn send(
        &self,
        credentials: &ChannelCredentials,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult {
        let ChannelCredentials::Evolution {
            base_url,
            instance,
            api_key,
        } = credentials
        else {
            return SendResult::failed(SendFailure::Configuration(
                "evolution adapter given non evolution credentials".into(),
            ));
        };
        if base_url.is_empty() || instance.is_empty() || api_key.is_empty() {
            return SendResult::failed(SendFailure::Configuration(
                "missing evolution baseUrl, instance or apikey".into(),
            ));
        }
        let Some(to) = normalize_phone(to) else {
            return SendResult::failed(SendFailure::Configuration(format!(
                "invalid recipient phone: {to}"
            )));
        };

        let (path, body) = send_request(instance, &to, content);
        let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
        let response = match self
            .client
            .post(&url)
            .header("apikey", api_key)
            .json(&body)
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
        let parsed: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

        if !status.is_success() {
            let message =
                error_message(&parsed).unwrap_or_else(|| raw.chars().take(300).collect());
            tracing::warn!(status = status.as_u16(), error = %message, "Evolution rejected message");
            return SendResult::failed(SendFailure::ProviderRejected {
                status: status.as_u16(),
                message,
            });
        }

        let id = parsed
            .pointer("/key/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        SendResult::sent(id)
    }
}

fn text_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn message_content(message: &Value) -> Option<(String, Option<InboundMedia>)> {
    if let Some(text) = text_at(message, "/conversation")
        .or_else(|| text_at(message, "/extendedTextMessage/text"))
        .or_else(|| text_at(message, "/buttonsResponseMessage/selectedDisplayText"))
        .or_else(|| text_at(message, "/listResponseMessage/title"))
    {
        return Some((text.to_string(), None));
    }

    const MEDIA: [(&str, MediaKind); 5] = [
        ("imageMessage", MediaKind::Image),
        ("stickerMessage", MediaKind::Image),
        ("audioMessage", MediaKind::Audio),
        ("videoMessage", MediaKind::Video),
        ("documentMessage", MediaKind::Document),
    ];
    MEDIA.iter().find_map(|(field, kind)| {
        let node = message.get(*field)?;
        let caption = text_at(node, "/caption").map(str::to_string);
        let media = InboundMedia {
            kind: *kind,
            reference: text_at(node, "/url").map(str::to_string),
            caption: caption.clone(),
        };
        Some((media_placeholder(*kind, caption.as_deref()), Some(media)))
    })
}

fn is_customer_jid(jid: &str) -> bool {
    !(jid.ends_with("@g.us") || jid.ends_with("@broadcast") || jid.ends_with("@newsletter"))
}

fn parse_record(record: &Value) -> Option<InboundEvent> {
    if record
        .pointer("/key/fromMe")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    let jid = text_at(record, "/key/remoteJid")?;
    if !is_customer_jid(jid) {
        return None;
    }
    let phone = normalize_phone(jid.split('@').next().unwrap_or(jid))?;
    let (content, media) = message_content(record.get("message")?)?;

    let provider_timestamp = record
        .get("messageTimestamp")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Some(InboundEvent {
        phone_number: phone,
        display_name: text_at(record, "/pushName").map(str::to_string),
        content,
        provider_message_id: text_at(record, "/key/id").map(str::to_string),
        provider_timestamp,
        external_id: Some(jid.to_string()),
        media,
    })
}

/// The `apikey` field some Evolution deployments include in webhook bodies.
pub fn payload_api_key(payload: &Value) -> Option<&str> {
    text_at(payload, "/apikey")
}

/// Extract customer messages from an Evolution webhook.
///
/// Anything other than `messages.upsert`, own messages (`fromMe`), and group or
/// broadcast chats is counted in `ignored`.
pub fn parse_webhook(payload: &Value) -> WebhookBatch {
    let mut batch = WebhookBatch::default();

    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase()
        .replace('_', ".");
    if event != "messages.upsert" {
        batch.ignored = 1;
        return batch;
    }

    let records: Vec<&Value> = match payload.get("data") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(obj)) => match obj.get("messages") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![payload.get("data").unwrap_or(&Value::Null)],
        },
        _ => Vec::new(),
    };

    for record in records {
        match parse_record(record) {
            Some(event) => batch.events.push(event),
            None => batch.ignored += 1,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(data: Value) -> Value {
        json!({ "event": "messages.upsert", "instance": "shop", "data": data })
    }

    #[test]
    fn parses_plain_conversation() {
        let payload = upsert(json!({
            "key": { "remoteJid": "5511988887777@s.whatsapp.net", "fromMe": false, "id": "ABC" },
            "pushName": "Bruno",
            "message": { "conversation": "is it still available?" },
            "messageTimestamp": 1700000100
        }));
        let batch = parse_webhook(&payload);
        assert_eq!(batch.events.len(), 1);
        let ev = &batch.events[0];
        assert_eq!(ev.phone_number, "5511988887777");
        assert_eq!(ev.display_name.as_deref(), Some("Bruno"));
        assert_eq!(ev.provider_message_id.as_deref(), Some("ABC"));
        assert_eq!(ev.content, "is it still available?");
        assert_eq!(ev.external_id.as_deref(), Some("5511988887777@s.whatsapp.net"));
    }

    #[test]
    fn skips_own_group_and_other_events() {
        let own = upsert(json!({
            "key": { "remoteJid": "551@s.whatsapp.net", "fromMe": true, "id": "1" },
            "message": { "conversation": "echo" }
        }));
        assert!(parse_webhook(&own).events.is_empty());

        let group = upsert(json!({
            "key": { "remoteJid": "1203630@g.us", "fromMe": false, "id": "2" },
            "message": { "conversation": "hi all" }
        }));
        assert_eq!(parse_webhook(&group).ignored, 1);

        let update = json!({ "event": "messages.update", "data": {} });
        assert!(parse_webhook(&update).events.is_empty());
    }

    #[test]
    fn extended_text_and_media_captions() {
        let payload = upsert(json!([
            {
                "key": { "remoteJid": "551@s.whatsapp.net", "id": "a" },
                "message": { "extendedTextMessage": { "text": "see link" } }
            },
            {
                "key": { "remoteJid": "551@s.whatsapp.net", "id": "b" },
                "message": { "imageMessage": { "caption": "this one", "url": "https://mmg/x" } }
            }
        ]));
        let batch = parse_webhook(&payload);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].content, "see link");
        assert_eq!(batch.events[1].content, "[image] this one");
    }

    #[test]
    fn error_message_variants() {
        assert_eq!(
            error_message(&json!({ "response": { "message": ["number not on whatsapp"] } }))
                .as_deref(),
            Some("number not on whatsapp")
        );
        assert_eq!(
            error_message(&json!({ "message": "Unauthorized" })).as_deref(),
            Some("Unauthorized")
        );
        assert!(error_message(&json!({})).is_none());
    }

    #[test]
    fn media_request_uses_send_media() {
        let content = OutboundContent {
            text: "cap".into(),
            media: Some(crate::channels::MediaAttachment {
                kind: MediaKind::Video,
                url: "https://cdn/v.mp4".into(),
                filename: None,
            }),
        };
        let (path, body) = send_request("shop", "551", &content);
        assert_eq!(path, "message/sendMedia/shop");
        assert_eq!(body["mediatype"], "video");
    }
}
