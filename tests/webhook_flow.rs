//! End-to-end flow over real HTTP: webhook in, debounced AI reply out,
//! follow-up step later, with the event feed observed over WebSocket.
//!
//! Time is driven by a `ManualClock`; queued jobs are run explicitly with
//! `process_next` instead of worker pools so every step is deterministic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use followup_engine::ai::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCompletionRequest,
    ToolCompletionResponse,
};
use followup_engine::app::{EngineSettings, Services};
use followup_engine::channels::{
    ChannelAdapter, ChannelCredentials, ChannelKind, ChannelRouter, OutboundContent, SendResult,
};
use followup_engine::clock::{Clock, ManualClock};
use followup_engine::error::LlmError;
use followup_engine::http;
use followup_engine::queue::JobStatus;
use followup_engine::sequence::{SequenceFamily, SequenceRule, SequenceStatus};
use followup_engine::store::model::Workspace;
use followup_engine::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to wait for an event.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies with a fixed sentence; never calls tools.
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: "Thanks for reaching out!".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn complete_with_tools(
        &self,
        _request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        Ok(ToolCompletionResponse {
            content: Some("Thanks for reaching out!".to_string()),
            tool_calls: vec![],
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Default)]
struct RecordingEvolution {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChannelAdapter for RecordingEvolution {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Evolution
    }

    async fn send(
        &self,
        _credentials: &ChannelCredentials,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content.text.clone()));
        SendResult::sent(Some(format!("EVO-{}", sent.len())))
    }
}

struct TestApp {
    port: u16,
    services: Services,
    clock: Arc<ManualClock>,
    adapter: Arc<RecordingEvolution>,
    workspace: Workspace,
}

async fn start_app() -> TestApp {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let workspace = Workspace::new("Acme", "You help Acme customers.");
    db.upsert_workspace(&workspace).await.unwrap();
    db.upsert_channel_credentials(
        workspace.id,
        &ChannelCredentials::Evolution {
            base_url: "http://evolution.invalid".into(),
            instance: "acme".into(),
            api_key: "evo-secret".into(),
        },
    )
    .await
    .unwrap();
    db.insert_sequence_rule(&SequenceRule::new(
        workspace.id,
        SequenceFamily::FollowUp,
        chrono::Duration::hours(1),
        "Ask {{name}} if they still need help",
        0,
    ))
    .await
    .unwrap();

    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
    ));
    let adapter = Arc::new(RecordingEvolution::default());
    let services = Services::build(
        db,
        clock.clone(),
        Arc::new(StubLlm),
        ChannelRouter::new().with_adapter(adapter.clone()),
        EngineSettings::default(),
    );

    let app = http::router(services.app_state());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestApp {
        port,
        services,
        clock,
        adapter,
        workspace,
    }
}

fn upsert(id: &str, text: &str) -> Value {
    json!({
        "event": "messages.upsert",
        "instance": "acme",
        "data": {
            "key": { "remoteJid": "5511988887777@s.whatsapp.net", "fromMe": false, "id": id },
            "pushName": "Bruno",
            "message": { "conversation": text },
            "messageTimestamp": 1740819600
        }
    })
}

async fn post_evolution(app: &TestApp, key: &str, payload: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!(
            "http://127.0.0.1:{}/webhooks/evolution/{}",
            app.port, app.workspace.id
        ))
        .header("apikey", key)
        .json(payload)
        .send()
        .await
        .unwrap()
}

/// Read feed events until one with `type == kind` arrives.
async fn next_event<S>(ws: &mut S, kind: &str) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                let event: Value = serde_json::from_str(&text).unwrap();
                if event["type"] == kind {
                    return event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

#[tokio::test]
async fn webhook_to_reply_to_follow_up() {
    let app = start_app().await;
    let (mut ws, _) = connect_async(format!(
        "ws://127.0.0.1:{}/ws/events?workspace_id={}",
        app.port, app.workspace.id
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Inbound
    let response = post_evolution(&app, "evo-secret", &upsert("MSG1", "is the sofa available?")).await;
    assert_eq!(response.status(), 200);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["accepted"], 1);

    let inbound = next_event(&mut ws, "new_message").await;
    assert_eq!(inbound["senderKind"], "CLIENT");
    assert_eq!(inbound["workspaceId"], app.workspace.id.to_string());
    let created = next_event(&mut ws, "conversation_updated").await;
    assert_eq!(created["created"], true);
    let follow_up = next_event(&mut ws, "sequence_updated").await;
    assert_eq!(follow_up["status"], "ACTIVE");

    // Debounce elapses; the batch job replies.
    app.clock.advance(chrono::Duration::seconds(5));
    let done = app
        .services
        .batch_queue
        .process_next(app.services.coordinator.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    let reply = next_event(&mut ws, "new_message").await;
    assert_eq!(reply["senderKind"], "AI");
    assert_eq!(reply["status"], "PENDING");
    let delivered = next_event(&mut ws, "message_status_update").await;
    assert_eq!(delivered["status"], "SENT");
    assert_eq!(delivered["providerMessageId"], "EVO-1");

    // One hour of silence fires the follow-up.
    app.clock.advance(chrono::Duration::hours(1));
    let step = app
        .services
        .sequence_queue
        .process_next(app.services.scheduler.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, JobStatus::Completed);

    let sent = app.adapter.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(to, _)| to == "5511988887777"));

    let follow_up_id = follow_up["id"].as_str().unwrap().parse().unwrap();
    let run = app
        .services
        .db
        .get_sequence_run(follow_up_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, SequenceStatus::Completed);
    assert!(app.clock.now() > run.started_at);
}

#[tokio::test]
async fn redelivery_and_bad_key() {
    let app = start_app().await;
    let payload = upsert("MSG1", "hello");

    let first = post_evolution(&app, "evo-secret", &payload).await;
    assert_eq!(first.status(), 200);
    let again: Value = post_evolution(&app, "evo-secret", &payload)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["duplicates"], 1);
    assert_eq!(again["accepted"], 0);

    let denied = post_evolution(&app, "wrong", &upsert("MSG2", "hello?")).await;
    assert_eq!(denied.status(), 401);

    let missing = reqwest::Client::new()
        .post(format!(
            "http://127.0.0.1:{}/webhooks/evolution/{}",
            app.port,
            uuid::Uuid::new_v4()
        ))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn health_endpoint() {
    let app = start_app().await;
    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", app.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}
