//! In-crate test doubles: a scripted LLM, a recording channel adapter, and a
//! harness wiring both into a fresh in-memory store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use serde_json::Value;

use crate::ai::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};
use crate::ai::ResponseGenerator;
use crate::channels::{
    ChannelAdapter, ChannelCredentials, ChannelKind, ChannelRouter, OutboundContent, SendFailure,
    SendResult,
};
use crate::clock::{Clock, ManualClock};
use crate::error::LlmError;
use crate::http::AppState;
use crate::ingest::IngestDispatcher;
use crate::notify::{Gateway, NotificationBus};
use crate::pipeline::coordinator::{BatchCoordinator, CoordinatorConfig};
use crate::pipeline::outbound::Outbox;
use crate::queue::{BATCH_QUEUE, JobQueue, QueuePolicy, SEQUENCE_QUEUE};
use crate::resolver::{ResolveRequest, Resolver};
use crate::sequence::SequenceScheduler;
use crate::store::model::{Client, Conversation, Workspace};
use crate::store::{Database, LibSqlBackend};

/// One scripted LLM turn.
#[derive(Debug, Clone)]
pub enum Scripted {
    Text(String),
    Tool { name: String, arguments: Value },
    Fail,
}

impl Scripted {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn tool(name: &str, arguments: Value) -> Self {
        Self::Tool {
            name: name.to_string(),
            arguments,
        }
    }
}

/// Replays scripted turns in order; answers "stub reply" once exhausted.
pub struct StubLlm {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl StubLlm {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn next(&self, messages: Vec<ChatMessage>) -> Scripted {
        self.calls.lock().unwrap().push(messages);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::text("stub reply"))
    }

    fn failure() -> LlmError {
        LlmError::RequestFailed {
            provider: "stub".into(),
            reason: "scripted failure".into(),
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.next(request.messages) {
            Scripted::Text(content) => Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            }),
            Scripted::Tool { .. } => Err(LlmError::InvalidResponse {
                provider: "stub".into(),
                reason: "tool call scripted for a plain completion".into(),
            }),
            Scripted::Fail => Err(Self::failure()),
        }
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        match self.next(request.messages) {
            Scripted::Text(content) => Ok(ToolCompletionResponse {
                content: Some(content),
                tool_calls: Vec::new(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            }),
            Scripted::Tool { name, arguments } => Ok(ToolCompletionResponse {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "call_0".into(),
                    name,
                    arguments,
                }],
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::ToolUse,
            }),
            Scripted::Fail => Err(Self::failure()),
        }
    }
}

/// Evolution-kind adapter that records every send.
#[derive(Default)]
pub struct RecordingAdapter {
    sent: Mutex<Vec<(String, String)>>,
    failure: Mutex<Option<SendFailure>>,
}

impl RecordingAdapter {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_with(&self, failure: SendFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Evolution
    }

    async fn send(
        &self,
        _credentials: &ChannelCredentials,
        to: &str,
        content: &OutboundContent,
    ) -> SendResult {
        if let Some(failure) = self.failure.lock().unwrap().clone() {
            return SendResult::failed(failure);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content.text.clone()));
        SendResult::sent(Some(format!("prov-{}", sent.len())))
    }
}

pub fn evolution_credentials() -> ChannelCredentials {
    ChannelCredentials::Evolution {
        base_url: "http://evolution.local".into(),
        instance: "shop".into(),
        api_key: "evo-key".into(),
    }
}

pub struct Harness {
    pub db: Arc<dyn Database>,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<NotificationBus>,
    pub gateway: Arc<Gateway>,
    pub adapter: Arc<RecordingAdapter>,
    pub outbox: Arc<Outbox>,
    pub llm: Arc<StubLlm>,
    pub generator: Arc<ResponseGenerator>,
    pub batch_queue: Arc<JobQueue>,
    pub sequence_queue: Arc<JobQueue>,
    pub scheduler: Arc<SequenceScheduler>,
    pub workspace: Workspace,
    pub debounce: Duration,
}

impl Harness {
    pub async fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let bus = Arc::new(NotificationBus::new());
        let gateway = Arc::new(Gateway::new(db.clone(), bus.clone(), dyn_clock.clone()));

        let adapter = Arc::new(RecordingAdapter::default());
        let router = Arc::new(ChannelRouter::new().with_adapter(adapter.clone()));
        let outbox = Arc::new(Outbox::new(gateway.clone(), router));

        let llm = Arc::new(StubLlm::new(script));
        let generator = Arc::new(ResponseGenerator::new(llm.clone()));

        let batch_queue = Arc::new(JobQueue::new(
            BATCH_QUEUE,
            db.clone(),
            dyn_clock.clone(),
            QueuePolicy::default(),
        ));
        let sequence_queue = Arc::new(JobQueue::new(
            SEQUENCE_QUEUE,
            db.clone(),
            dyn_clock,
            QueuePolicy::default(),
        ));
        let scheduler = Arc::new(SequenceScheduler::new(
            gateway.clone(),
            sequence_queue.clone(),
            generator.clone(),
            outbox.clone(),
        ));

        let workspace = Workspace::new("Acme Moving", "You are Acme's assistant.");
        db.upsert_workspace(&workspace).await.unwrap();
        db.upsert_channel_credentials(workspace.id, &evolution_credentials())
            .await
            .unwrap();

        Self {
            db,
            clock,
            bus,
            gateway,
            adapter,
            outbox,
            llm,
            generator,
            batch_queue,
            sequence_queue,
            scheduler,
            workspace,
            debounce: Duration::from_secs(3),
        }
    }

    /// Resolve a client named Ana on the Evolution channel.
    pub async fn client_conversation(&self, phone: &str) -> (Client, Conversation) {
        let resolved = Resolver::new(self.db.clone())
            .resolve(
                &ResolveRequest {
                    workspace_id: self.workspace.id,
                    phone_number: phone,
                    display_name: Some("Ana"),
                    channel: ChannelKind::Evolution,
                    external_id: None,
                    metadata: None,
                    ai_enabled: true,
                },
                self.clock.now(),
            )
            .await
            .unwrap();
        (resolved.client, resolved.conversation)
    }

    pub fn dispatcher(&self) -> IngestDispatcher {
        IngestDispatcher::new(
            self.gateway.clone(),
            Arc::new(Resolver::new(self.db.clone())),
            self.scheduler.clone(),
            self.batch_queue.clone(),
            self.debounce,
        )
    }

    pub fn app_state(&self, api_token: Option<&str>) -> AppState {
        AppState {
            gateway: self.gateway.clone(),
            dispatcher: Arc::new(self.dispatcher()),
            scheduler: self.scheduler.clone(),
            resolver: Arc::new(Resolver::new(self.db.clone())),
            api_token: api_token.map(|t| Arc::new(SecretString::from(t))),
        }
    }

    pub fn coordinator(&self) -> BatchCoordinator {
        BatchCoordinator::new(
            self.gateway.clone(),
            self.generator.clone(),
            self.outbox.clone(),
            CoordinatorConfig {
                debounce: self.debounce,
                ..CoordinatorConfig::default()
            },
        )
    }
}
