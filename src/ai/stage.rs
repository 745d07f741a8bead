//! Stages: named sub-flows the model can trigger as tools.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::store::model::ConversationContext;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// Side effect run when a stage completes with all required data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageAction {
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub description: String,
    /// Extra guidance appended to the system prompt while the stage is offered.
    pub instructions: String,
    pub required_fields: Vec<String>,
    pub action: Option<StageAction>,
    pub active: bool,
}

impl Stage {
    pub fn new(workspace_id: Uuid, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            description: description.into(),
            instructions: String::new(),
            required_fields: Vec::new(),
            action: None,
            active: true,
        }
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action(mut self, action: StageAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Tool name exposed to the model, e.g. `stage_book_a_visit`.
    pub fn tool_name(&self) -> String {
        let lower = self.name.to_lowercase();
        let slug = NON_SLUG.replace_all(&lower, "_");
        format!("stage_{}", slug.trim_matches('_'))
    }

    /// JSON schema requiring every declared field as a string.
    pub fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .required_fields
            .iter()
            .map(|f| (f.clone(), json!({ "type": "string" })))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_fields,
        })
    }

    /// Required fields still absent or blank in the collected data.
    pub fn missing_fields(&self, context: &ConversationContext) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|f| {
                context
                    .collected_data
                    .get(f.as_str())
                    .is_none_or(|v| v.trim().is_empty())
            })
            .cloned()
            .collect()
    }
}

/// Fold tool-call arguments into the context's collected data. Non-string
/// scalars are stringified; nulls and nested values are skipped.
pub fn merge_arguments(context: &mut ConversationContext, args: &Value) {
    let Some(obj) = args.as_object() else {
        return;
    };
    for (key, value) in obj {
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if !text.is_empty() {
            context.collected_data.insert(key.clone(), text);
        }
    }
}
