//! AI response generator: history + workspace prompt + stage tools in,
//! reply text or a structured signal out.
//!
//! No persistence and no channel I/O happens here. The only side effects are
//! the model calls and a stage's configured HTTP action.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::provider::{
    ChatMessage, CompletionRequest, LlmProvider, ToolCall, ToolCompletionRequest, ToolDefinition,
    truncate,
};
use crate::ai::stage::{Stage, StageAction, merge_arguments};
use crate::error::LlmError;
use crate::store::model::{ConversationContext, Message, SenderKind, Workspace};

/// Longest stage action response fed back to the model.
const ACTION_RESULT_LIMIT: usize = 1000;

/// What the generator decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// User-facing text to send.
    Reply(String),
    /// A stage was called without all of its required fields.
    MissingData { stage: String, fields: Vec<String> },
    /// Only side effects happened; nothing should be sent.
    ToolOnly,
}

pub struct GenerationInput<'a> {
    pub workspace: &'a Workspace,
    pub conversation_id: Uuid,
    /// Oldest first.
    pub history: &'a [Message],
    pub stages: &'a [Stage],
    pub context: &'a ConversationContext,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub outcome: GenerationOutcome,
    /// Updated context when a stage call changed it.
    pub context: Option<ConversationContext>,
}

impl Generation {
    fn plain(outcome: GenerationOutcome) -> Self {
        Self {
            outcome,
            context: None,
        }
    }
}

fn reply_or_silent(text: Option<String>) -> GenerationOutcome {
    match text.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => GenerationOutcome::Reply(t),
        _ => GenerationOutcome::ToolOnly,
    }
}

/// Map stored messages onto chat turns.
pub fn history_to_chat(history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|m| match m.sender {
            SenderKind::Client => ChatMessage::user(&m.content),
            SenderKind::Ai | SenderKind::Agent => ChatMessage::assistant(&m.content),
            SenderKind::System => ChatMessage::system(&m.content),
        })
        .collect()
}

/// Workspace prompt plus stage catalogue and current stage state.
pub fn build_system_prompt(
    workspace: &Workspace,
    stages: &[Stage],
    context: &ConversationContext,
) -> String {
    let mut prompt = workspace.system_prompt.trim().to_string();

    if !stages.is_empty() {
        prompt.push_str(
            "\n\n## Stages\nCall a stage tool once the customer has given every required field.",
        );
        for stage in stages {
            prompt.push_str(&format!(
                "\n- {} (tool `{}`): {}",
                stage.name,
                stage.tool_name(),
                stage.description
            ));
            if !stage.required_fields.is_empty() {
                prompt.push_str(&format!(" Required: {}.", stage.required_fields.join(", ")));
            }
            if !stage.instructions.trim().is_empty() {
                prompt.push_str(&format!(" {}", stage.instructions.trim()));
            }
        }
    }

    if let Some(current) = &context.current_stage {
        prompt.push_str(&format!("\n\n## Current stage\n{current}"));
    }
    if !context.collected_data.is_empty() {
        prompt.push_str("\n\n## Collected data");
        for (key, value) in &context.collected_data {
            prompt.push_str(&format!("\n- {key}: {value}"));
        }
    }
    prompt
}

/// Template question used when the model cannot phrase one.
pub fn missing_data_question(stage: &str, fields: &[String]) -> String {
    let list = match fields {
        [] => "details".to_string(),
        [one] => one.replace('_', " "),
        [init @ .., last] => format!(
            "{} and {}",
            init.iter()
                .map(|f| f.replace('_', " "))
                .collect::<Vec<_>>()
                .join(", "),
            last.replace('_', " ")
        ),
    };
    format!("To continue with {stage}, could you share your {list}?")
}

pub struct ResponseGenerator {
    llm: Arc<dyn LlmProvider>,
    http: reqwest::Client,
    max_tokens: u32,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            max_tokens: 512,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Produce a reply for the conversation.
    pub async fn generate(&self, input: GenerationInput<'_>) -> Result<Generation, LlmError> {
        let mut messages = vec![ChatMessage::system(build_system_prompt(
            input.workspace,
            input.stages,
            input.context,
        ))];
        messages.extend(history_to_chat(input.history));

        if input.stages.is_empty() {
            let response = self
                .llm
                .complete(CompletionRequest::new(messages).with_max_tokens(self.max_tokens))
                .await?;
            return Ok(Generation::plain(reply_or_silent(Some(response.content))));
        }

        let tools: Vec<ToolDefinition> = input
            .stages
            .iter()
            .map(|s| ToolDefinition {
                name: s.tool_name(),
                description: s.description.clone(),
                parameters: s.parameters_schema(),
            })
            .collect();

        let mut request = ToolCompletionRequest::new(messages.clone(), tools);
        request.max_tokens = Some(self.max_tokens);
        let response = self.llm.complete_with_tools(request).await?;

        let stage_call = response.tool_calls.iter().find_map(|call| {
            input
                .stages
                .iter()
                .find(|s| s.tool_name() == call.name)
                .map(|s| (s, call))
        });

        let Some((stage, call)) = stage_call else {
            if !response.tool_calls.is_empty() {
                warn!(
                    conversation_id = %input.conversation_id,
                    tools = ?response.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "Model called unknown tools"
                );
            }
            return Ok(Generation::plain(reply_or_silent(response.content)));
        };

        self.run_stage(input, messages, stage, call, response.content)
            .await
    }

    async fn run_stage(
        &self,
        input: GenerationInput<'_>,
        messages: Vec<ChatMessage>,
        stage: &Stage,
        call: &ToolCall,
        text: Option<String>,
    ) -> Result<Generation, LlmError> {
        let mut context = input.context.clone();
        merge_arguments(&mut context, &call.arguments);

        let missing = stage.missing_fields(&context);
        if !missing.is_empty() {
            debug!(
                conversation_id = %input.conversation_id,
                stage = %stage.name,
                missing = ?missing,
                "Stage called with missing data"
            );
            return Ok(Generation {
                outcome: GenerationOutcome::MissingData {
                    stage: stage.name.clone(),
                    fields: missing,
                },
                context: Some(context),
            });
        }

        context.enter_stage(&stage.name);
        info!(conversation_id = %input.conversation_id, stage = %stage.name, "Stage entered");

        let Some(action) = &stage.action else {
            return Ok(Generation {
                outcome: reply_or_silent(text),
                context: Some(context),
            });
        };

        let result = self
            .run_action(action, stage, input.conversation_id, &context)
            .await;

        let mut follow_up = messages;
        follow_up.push(ChatMessage::assistant_with_tool_calls(
            text,
            vec![call.clone()],
        ));
        follow_up.push(ChatMessage::tool_result(&call.id, &result));
        let response = self
            .llm
            .complete(CompletionRequest::new(follow_up).with_max_tokens(self.max_tokens))
            .await?;

        let reply = if response.content.trim().is_empty() {
            result
        } else {
            response.content.trim().to_string()
        };
        Ok(Generation {
            outcome: reply_or_silent(Some(reply)),
            context: Some(context),
        })
    }

    /// Execute a stage's HTTP action. Failures become result text for the
    /// model rather than errors.
    async fn run_action(
        &self,
        action: &StageAction,
        stage: &Stage,
        conversation_id: Uuid,
        context: &ConversationContext,
    ) -> String {
        let StageAction::Http {
            url,
            method,
            headers,
        } = action;

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut request = self.http.request(method, url).json(&json!({
            "stage": stage.name,
            "conversationId": conversation_id,
            "data": context.collected_data,
        }));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let body = truncate(body.trim(), ACTION_RESULT_LIMIT).to_string();
                if status.is_success() {
                    info!(stage = %stage.name, status = %status, "Stage action completed");
                    body
                } else {
                    warn!(stage = %stage.name, status = %status, "Stage action rejected");
                    format!("Action failed with HTTP {status}: {body}")
                }
            }
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "Stage action request failed");
                format!("Action failed: {e}")
            }
        }
    }

    /// Phrase a natural follow-up question for missing stage data.
    pub async fn ask_for_missing(
        &self,
        workspace: &Workspace,
        history: &[Message],
        stage: &str,
        fields: &[String],
    ) -> String {
        let mut messages = vec![ChatMessage::system(workspace.system_prompt.trim())];
        messages.extend(history_to_chat(history));
        messages.push(ChatMessage::user(format!(
            "Before continuing with \"{stage}\" you still need: {}. Ask the customer for them in one short, friendly message. Reply with the message only.",
            fields.join(", ")
        )));

        match self
            .llm
            .complete(CompletionRequest::new(messages).with_max_tokens(self.max_tokens))
            .await
        {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content.trim().to_string(),
            Ok(_) => missing_data_question(stage, fields),
            Err(e) => {
                warn!(stage, error = %e, "Missing-data question generation failed, using template");
                missing_data_question(stage, fields)
            }
        }
    }

    /// Write one outbound sequence message following `instruction`.
    pub async fn compose_sequence_message(
        &self,
        workspace: &Workspace,
        history: &[Message],
        instruction: &str,
    ) -> Result<String, LlmError> {
        let mut messages = vec![ChatMessage::system(workspace.system_prompt.trim())];
        messages.extend(history_to_chat(history));
        messages.push(ChatMessage::user(format!(
            "Write the next message to send to the customer. Instruction: {instruction}\nReply with the message text only."
        )));

        let resp = self
            .llm
            .complete(CompletionRequest::new(messages).with_max_tokens(self.max_tokens))
            .await?;
        let text = resp.content.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty completion".to_string(),
            });
        }
        Ok(text.to_string())
    }
}
