//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::ai::LlmConfig;
use crate::error::ConfigError;
use crate::pipeline::CoordinatorConfig;
use crate::queue::QueuePolicy;

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Bearer token for `/api/*`; open when unset.
    pub api_token: Option<SecretString>,
    pub coordinator: CoordinatorConfig,
    pub batch_queue: QueuePolicy,
    pub sequence_queue: QueuePolicy,
    pub llm: LlmConfig,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = non_empty(&lookup, "LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;

        let poll_interval = Duration::from_millis(parsed(&lookup, "FOLLOWUP_QUEUE_POLL_MS", 500));
        let stall_timeout = Duration::from_secs(parsed(&lookup, "FOLLOWUP_STALL_TIMEOUT_SECS", 300));

        let batch_queue = QueuePolicy {
            concurrency: parsed(&lookup, "FOLLOWUP_BATCH_CONCURRENCY", 5usize).max(1),
            max_attempts: parsed(&lookup, "FOLLOWUP_BATCH_MAX_ATTEMPTS", 3u32).max(1),
            backoff_base: Duration::from_millis(parsed(&lookup, "FOLLOWUP_BATCH_BACKOFF_MS", 2000)),
            poll_interval,
            stall_timeout,
        };
        let sequence_queue = QueuePolicy {
            concurrency: parsed(&lookup, "FOLLOWUP_SEQUENCE_CONCURRENCY", 3usize).max(1),
            max_attempts: parsed(&lookup, "FOLLOWUP_SEQUENCE_MAX_ATTEMPTS", 5u32).max(1),
            backoff_base: Duration::from_millis(parsed(
                &lookup,
                "FOLLOWUP_SEQUENCE_BACKOFF_MS",
                10_000,
            )),
            poll_interval,
            stall_timeout,
        };

        let base_url = non_empty(&lookup, "LLM_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "LLM_BASE_URL".to_string(),
                message: format!("expected an http(s) URL, got {base_url}"),
            });
        }

        Ok(Self {
            db_path: non_empty(&lookup, "FOLLOWUP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/followup.db")),
            http_port: parsed(&lookup, "FOLLOWUP_HTTP_PORT", 8080),
            api_token: non_empty(&lookup, "FOLLOWUP_API_TOKEN").map(SecretString::from),
            coordinator: CoordinatorConfig {
                debounce: Duration::from_millis(parsed(&lookup, "FOLLOWUP_DEBOUNCE_MS", 3000)),
                history_window: parsed(&lookup, "FOLLOWUP_HISTORY_WINDOW", 20usize).max(1),
            },
            batch_queue,
            sequence_queue,
            llm: LlmConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: SecretString::from(api_key),
                model: non_empty(&lookup, "LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(parsed(&lookup, "LLM_TIMEOUT_SECS", 60)),
            },
            log_dir: non_empty(&lookup, "LOG_DIR").map(PathBuf::from),
        })
    }
}
