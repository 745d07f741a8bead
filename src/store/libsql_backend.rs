//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection. Timestamps are written as fixed-width RFC 3339 with
//! microseconds so string comparison in SQL matches chronological order.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ai::stage::{Stage, StageAction};
use crate::channels::{ChannelCredentials, ChannelKind};
use crate::error::DatabaseError;
use crate::queue::job::{JobRecord, JobStatus};
use crate::sequence::model::{
    CartDetails, SequenceFamily, SequenceRule, SequenceRun, SequenceStatus,
};
use crate::store::migrations;
use crate::store::model::{
    Client, Conversation, ConversationContext, ConversationStatus, DeliveryStatus, Message,
    MessageCursor, NewMessage, SenderKind, Workspace,
};
use crate::store::traits::{ClientUpsert, Database};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_rows<T>(
        &self,
        ctx: &'static str,
        sql: &str,
        params: impl IntoParams,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?
        {
            out.push(map(&row)?);
        }
        Ok(out)
    }

    async fn query_one<T>(
        &self,
        ctx: &'static str,
        sql: &str,
        params: impl IntoParams,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        Ok(self
            .query_rows(ctx, sql, params, map)
            .await?
            .into_iter()
            .next())
    }

    async fn exec(
        &self,
        ctx: &'static str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical fixed-width timestamp encoding.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("read column: {e}"))
}

fn text(row: &Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx).map_err(col_err)
}

fn opt_col(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int(row: &Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx).map_err(col_err)
}

fn uuid_col(row: &Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let raw = text(row, idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid {raw:?}: {e}")))
}

fn parsed<T: FromStr>(row: &Row, idx: i32) -> Result<T, DatabaseError>
where
    T::Err: std::fmt::Display,
{
    let raw = text(row, idx)?;
    raw.parse::<T>()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: i32) -> Result<T, DatabaseError> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const WORKSPACE_COLUMNS: &str = "id, name, system_prompt, ai_enabled_default, created_at";

fn row_to_workspace(row: &Row) -> Result<Workspace, DatabaseError> {
    Ok(Workspace {
        id: uuid_col(row, 0)?,
        name: text(row, 1)?,
        system_prompt: text(row, 2)?,
        ai_enabled_default: int(row, 3)? != 0,
        created_at: parse_datetime(&text(row, 4)?),
    })
}

const CLIENT_COLUMNS: &str = "id, workspace_id, channel, external_id, phone_number, display_name, metadata, created_at, updated_at";

fn row_to_client(row: &Row) -> Result<Client, DatabaseError> {
    Ok(Client {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        channel: parsed::<ChannelKind>(row, 2)?,
        external_id: opt_col(row, 3),
        phone_number: text(row, 4)?,
        display_name: opt_col(row, 5),
        metadata: opt_col(row, 6)
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        created_at: parse_datetime(&text(row, 7)?),
        updated_at: parse_datetime(&text(row, 8)?),
    })
}

const CONVERSATION_COLUMNS: &str = "id, workspace_id, client_id, channel, status, ai_enabled, last_activity_at, external_thread_id, context, created_at";

fn row_to_conversation(row: &Row) -> Result<Conversation, DatabaseError> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        client_id: uuid_col(row, 2)?,
        channel: parsed::<ChannelKind>(row, 3)?,
        status: parsed::<ConversationStatus>(row, 4)?,
        ai_enabled: int(row, 5)? != 0,
        last_activity_at: parse_datetime(&text(row, 6)?),
        external_thread_id: opt_col(row, 7),
        context: ConversationContext::from_json(&opt_col(row, 8).unwrap_or_default()),
        created_at: parse_datetime(&text(row, 9)?),
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, content, timestamp, status, provider_message_id, error, metadata";

fn row_to_message(row: &Row) -> Result<Message, DatabaseError> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        conversation_id: uuid_col(row, 1)?,
        sender: parsed::<SenderKind>(row, 2)?,
        content: text(row, 3)?,
        timestamp: parse_datetime(&text(row, 4)?),
        status: parsed::<DeliveryStatus>(row, 5)?,
        provider_message_id: opt_col(row, 6),
        error: opt_col(row, 7),
        metadata: opt_col(row, 8).and_then(|m| serde_json::from_str(&m).ok()),
    })
}

const RULE_COLUMNS: &str = "id, workspace_id, family, delay_seconds, instruction, position";

fn row_to_rule(row: &Row) -> Result<SequenceRule, DatabaseError> {
    Ok(SequenceRule {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        family: parsed::<SequenceFamily>(row, 2)?,
        delay_seconds: int(row, 3)?,
        instruction: text(row, 4)?,
        position: int(row, 5)?,
    })
}

const RUN_COLUMNS: &str = "id, workspace_id, client_id, conversation_id, family, status, current_step, next_fire_at, started_at, completed_at, cart, paused_at";

fn row_to_run(row: &Row) -> Result<SequenceRun, DatabaseError> {
    let conversation_id = opt_col(row, 3)
        .map(|raw| Uuid::parse_str(&raw))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(SequenceRun {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        client_id: uuid_col(row, 2)?,
        conversation_id,
        family: parsed::<SequenceFamily>(row, 4)?,
        status: parsed::<SequenceStatus>(row, 5)?,
        current_step: int(row, 6)?,
        next_fire_at: parse_optional_datetime(opt_col(row, 7)),
        started_at: parse_datetime(&text(row, 8)?),
        completed_at: parse_optional_datetime(opt_col(row, 9)),
        cart: opt_col(row, 10).and_then(|c| serde_json::from_str::<CartDetails>(&c).ok()),
        paused_at: parse_optional_datetime(opt_col(row, 11)),
    })
}

const STAGE_COLUMNS: &str =
    "id, workspace_id, name, description, instructions, required_fields, action, active";

fn row_to_stage(row: &Row) -> Result<Stage, DatabaseError> {
    Ok(Stage {
        id: uuid_col(row, 0)?,
        workspace_id: uuid_col(row, 1)?,
        name: text(row, 2)?,
        description: text(row, 3)?,
        instructions: text(row, 4)?,
        required_fields: json_col(row, 5)?,
        action: opt_col(row, 6).and_then(|a| serde_json::from_str::<StageAction>(&a).ok()),
        active: int(row, 7)? != 0,
    })
}

const JOB_COLUMNS: &str = "id, queue, payload, status, attempts, max_attempts, run_at, locked_until, last_error, created_at, updated_at";

fn row_to_job(row: &Row) -> Result<JobRecord, DatabaseError> {
    Ok(JobRecord {
        id: text(row, 0)?,
        queue: text(row, 1)?,
        payload: json_col(row, 2)?,
        status: parsed::<JobStatus>(row, 3)?,
        attempts: u32::try_from(int(row, 4)?).unwrap_or(0),
        max_attempts: u32::try_from(int(row, 5)?).unwrap_or(0),
        run_at: parse_datetime(&text(row, 6)?),
        locked_until: parse_optional_datetime(opt_col(row, 7)),
        last_error: opt_col(row, 8),
        created_at: parse_datetime(&text(row, 9)?),
        updated_at: parse_datetime(&text(row, 10)?),
    })
}

fn credentials_channel(credentials: &ChannelCredentials) -> &'static str {
    credentials.kind().as_str()
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workspaces ──────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError> {
        self.exec(
            "upsert_workspace",
            "INSERT INTO workspaces (id, name, system_prompt, ai_enabled_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                ai_enabled_default = excluded.ai_enabled_default",
            params![
                workspace.id.to_string(),
                workspace.name.clone(),
                workspace.system_prompt.clone(),
                i64::from(workspace.ai_enabled_default),
                fmt_ts(&workspace.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError> {
        self.query_one(
            "get_workspace",
            &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
            params![id.to_string()],
            row_to_workspace,
        )
        .await
    }

    async fn upsert_channel_credentials(
        &self,
        workspace_id: Uuid,
        credentials: &ChannelCredentials,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "upsert_channel_credentials",
            "INSERT INTO channel_credentials (workspace_id, channel, credentials, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workspace_id, channel) DO UPDATE SET
                credentials = excluded.credentials,
                updated_at = excluded.updated_at",
            params![
                workspace_id.to_string(),
                credentials_channel(credentials),
                to_json(credentials)?,
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_channel_credentials(
        &self,
        workspace_id: Uuid,
        channel: ChannelKind,
    ) -> Result<Option<ChannelCredentials>, DatabaseError> {
        self.query_one(
            "get_channel_credentials",
            "SELECT credentials FROM channel_credentials WHERE workspace_id = ?1 AND channel = ?2",
            params![workspace_id.to_string(), channel.as_str()],
            |row| json_col(row, 0),
        )
        .await
    }

    async fn insert_sequence_rule(&self, rule: &SequenceRule) -> Result<(), DatabaseError> {
        self.exec(
            "insert_sequence_rule",
            "INSERT INTO sequence_rules (id, workspace_id, family, delay_seconds, instruction, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id.to_string(),
                rule.workspace_id.to_string(),
                rule.family.as_str(),
                rule.delay_seconds,
                rule.instruction.clone(),
                rule.position,
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_sequence_rules(
        &self,
        workspace_id: Uuid,
        family: SequenceFamily,
    ) -> Result<Vec<SequenceRule>, DatabaseError> {
        let order = match family {
            SequenceFamily::FollowUp => "delay_seconds ASC, position ASC, created_at ASC",
            SequenceFamily::AbandonedCart => "position ASC, created_at ASC",
        };
        self.query_rows(
            "list_sequence_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM sequence_rules
                 WHERE workspace_id = ?1 AND family = ?2 ORDER BY {order}"
            ),
            params![workspace_id.to_string(), family.as_str()],
            row_to_rule,
        )
        .await
    }

    async fn upsert_stage(&self, stage: &Stage) -> Result<(), DatabaseError> {
        let action = stage.action.as_ref().map(to_json).transpose()?;
        self.exec(
            "upsert_stage",
            "INSERT INTO stages (id, workspace_id, name, description, instructions, required_fields, action, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                instructions = excluded.instructions,
                required_fields = excluded.required_fields,
                action = excluded.action,
                active = excluded.active",
            params![
                stage.id.to_string(),
                stage.workspace_id.to_string(),
                stage.name.clone(),
                stage.description.clone(),
                stage.instructions.clone(),
                to_json(&stage.required_fields)?,
                opt_text(action.as_deref()),
                i64::from(stage.active),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_active_stages(&self, workspace_id: Uuid) -> Result<Vec<Stage>, DatabaseError> {
        self.query_rows(
            "list_active_stages",
            &format!(
                "SELECT {STAGE_COLUMNS} FROM stages
                 WHERE workspace_id = ?1 AND active = 1 ORDER BY created_at ASC, name ASC"
            ),
            params![workspace_id.to_string()],
            row_to_stage,
        )
        .await
    }

    // ── Clients & conversations ─────────────────────────────────────

    async fn upsert_client(
        &self,
        upsert: &ClientUpsert<'_>,
        now: DateTime<Utc>,
    ) -> Result<(Client, bool), DatabaseError> {
        let ws = upsert.workspace_id.to_string();
        let channel = upsert.channel.as_str();
        let metadata = upsert.metadata.map(to_json).transpose()?;
        let now_s = fmt_ts(&now);

        let inserted = self
            .exec(
                "upsert_client",
                "INSERT INTO clients (id, workspace_id, channel, external_id, phone_number, display_name, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, '{}'), ?8, ?8)
                 ON CONFLICT(workspace_id, phone_number, channel) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    ws.clone(),
                    channel,
                    opt_text(upsert.external_id),
                    upsert.phone_number,
                    opt_text(upsert.display_name),
                    opt_text(metadata.as_deref()),
                    now_s.clone(),
                ],
            )
            .await?;
        let created = inserted == 1;

        if !created {
            self.exec(
                "upsert_client",
                "UPDATE clients SET
                    display_name = COALESCE(?4, display_name),
                    external_id = COALESCE(?5, external_id),
                    metadata = CASE WHEN ?6 IS NULL THEN metadata ELSE json_patch(metadata, ?6) END,
                    updated_at = ?7
                 WHERE workspace_id = ?1 AND phone_number = ?2 AND channel = ?3",
                params![
                    ws.clone(),
                    upsert.phone_number,
                    channel,
                    opt_text(upsert.display_name),
                    opt_text(upsert.external_id),
                    opt_text(metadata.as_deref()),
                    now_s,
                ],
            )
            .await?;
        }

        let client = self
            .query_one(
                "upsert_client",
                &format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients
                     WHERE workspace_id = ?1 AND phone_number = ?2 AND channel = ?3"
                ),
                params![ws, upsert.phone_number, channel],
                row_to_client,
            )
            .await?
            .ok_or_else(|| DatabaseError::not_found("client", upsert.phone_number))?;

        if created {
            debug!(client_id = %client.id, workspace_id = %client.workspace_id, "Client created");
        }
        Ok((client, created))
    }

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, DatabaseError> {
        self.query_one(
            "get_client",
            &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
            params![id.to_string()],
            row_to_client,
        )
        .await
    }

    async fn upsert_conversation(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
        channel: ChannelKind,
        ai_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool), DatabaseError> {
        let ws = workspace_id.to_string();
        let client = client_id.to_string();
        let now_s = fmt_ts(&now);

        let inserted = self
            .exec(
                "upsert_conversation",
                "INSERT INTO conversations (id, workspace_id, client_id, channel, status, ai_enabled, last_activity_at, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, '{}', ?6)
                 ON CONFLICT(workspace_id, client_id, channel) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    ws.clone(),
                    client.clone(),
                    channel.as_str(),
                    i64::from(ai_enabled),
                    now_s.clone(),
                ],
            )
            .await?;
        let created = inserted == 1;

        if !created {
            self.exec(
                "upsert_conversation",
                "UPDATE conversations SET
                    status = 'active',
                    last_activity_at = MAX(last_activity_at, ?4)
                 WHERE workspace_id = ?1 AND client_id = ?2 AND channel = ?3",
                params![ws.clone(), client.clone(), channel.as_str(), now_s],
            )
            .await?;
        }

        let conversation = self
            .query_one(
                "upsert_conversation",
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE workspace_id = ?1 AND client_id = ?2 AND channel = ?3"
                ),
                params![ws, client, channel.as_str()],
                row_to_conversation,
            )
            .await?
            .ok_or_else(|| DatabaseError::not_found("conversation", client_id))?;
        Ok((conversation, created))
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "get_conversation",
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
            row_to_conversation,
        )
        .await
    }

    async fn touch_conversation(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.exec(
            "touch_conversation",
            "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
            params![id.to_string(), fmt_ts(&now)],
        )
        .await?;
        Ok(())
    }

    async fn set_conversation_ai_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_conversation_ai_enabled",
            "UPDATE conversations SET ai_enabled = ?2 WHERE id = ?1",
            params![id.to_string(), i64::from(enabled)],
        )
        .await?;
        Ok(())
    }

    async fn close_conversation(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.exec(
            "close_conversation",
            "UPDATE conversations SET status = 'closed' WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn update_conversation_context(
        &self,
        id: Uuid,
        context: &ConversationContext,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "update_conversation_context",
            "UPDATE conversations SET context = ?2 WHERE id = ?1",
            params![id.to_string(), to_json(context)?],
        )
        .await?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &NewMessage) -> Result<Option<Message>, DatabaseError> {
        let id = Uuid::new_v4();
        let conversation = message.conversation_id.to_string();
        let requested = fmt_ts(&message.timestamp);
        let metadata = message.metadata.as_ref().map(to_json).transpose()?;

        // Clamp against the conversation's latest timestamp inside the same
        // statement so the per-conversation order stays monotonic.
        let stored_ts = self
            .query_one(
                "insert_message",
                "INSERT OR IGNORE INTO messages
                    (id, conversation_id, sender, content, timestamp, status, provider_message_id, metadata, created_at)
                 SELECT ?1, ?2, ?3, ?4,
                        MAX(?5, COALESCE((SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?2), ?5)),
                        ?6, ?7, ?8, ?9
                 RETURNING timestamp",
                params![
                    id.to_string(),
                    conversation,
                    message.sender.as_str(),
                    message.content.clone(),
                    requested,
                    message.status.as_str(),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(metadata.as_deref()),
                    fmt_ts(&Utc::now()),
                ],
                |row| text(row, 0),
            )
            .await?;

        let Some(stored_ts) = stored_ts else {
            debug!(
                conversation_id = %message.conversation_id,
                provider_message_id = ?message.provider_message_id,
                "Duplicate inbound message ignored"
            );
            return Ok(None);
        };

        Ok(Some(Message {
            id,
            conversation_id: message.conversation_id,
            sender: message.sender,
            content: message.content.clone(),
            timestamp: parse_datetime(&stored_ts),
            status: message.status,
            provider_message_id: message.provider_message_id.clone(),
            error: None,
            metadata: message.metadata.clone(),
        }))
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        self.query_one(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .await
    }

    async fn update_message_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .exec(
                "update_message_delivery",
                "UPDATE messages SET
                    status = ?2,
                    provider_message_id = COALESCE(?3, provider_message_id),
                    error = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    status.as_str(),
                    opt_text(provider_message_id),
                    opt_text(error),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::not_found("message", id));
        }
        Ok(())
    }

    async fn latest_message_at(
        &self,
        conversation_id: Uuid,
        sender: SenderKind,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let latest = self
            .query_one(
                "latest_message_at",
                "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1 AND sender = ?2",
                params![conversation_id.to_string(), sender.as_str()],
                |row| Ok(opt_col(row, 0)),
            )
            .await?;
        Ok(parse_optional_datetime(latest.flatten()))
    }

    async fn latest_message_cursor(
        &self,
        conversation_id: Uuid,
        sender: SenderKind,
    ) -> Result<Option<MessageCursor>, DatabaseError> {
        self.query_one(
            "latest_message_cursor",
            "SELECT timestamp, seq FROM messages
             WHERE conversation_id = ?1 AND sender = ?2
             ORDER BY timestamp DESC, seq DESC LIMIT 1",
            params![conversation_id.to_string(), sender.as_str()],
            |row| {
                Ok(MessageCursor {
                    timestamp: parse_datetime(&text(row, 0)?),
                    seq: int(row, 1)?,
                })
            },
        )
        .await
    }

    async fn client_messages_after(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let (after_ts, after_seq) = match after {
            Some(cursor) => (fmt_ts(&cursor.timestamp), cursor.seq),
            None => (fmt_ts(&DateTime::<Utc>::UNIX_EPOCH), 0),
        };
        // A clamped message shares its predecessor's timestamp; seq decides.
        self.query_rows(
            "client_messages_after",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND sender = 'client'
                   AND (timestamp > ?2 OR (timestamp = ?2 AND seq > ?3))
                 ORDER BY timestamp ASC, seq ASC"
            ),
            params![conversation_id.to_string(), after_ts, after_seq],
            row_to_message,
        )
        .await
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.query_rows(
            "recent_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT * FROM messages WHERE conversation_id = ?1
                    ORDER BY timestamp DESC, seq DESC LIMIT ?2
                 ) ORDER BY timestamp ASC, seq ASC"
            ),
            params![
                conversation_id.to_string(),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            row_to_message,
        )
        .await
    }

    // ── Sequence runs ───────────────────────────────────────────────

    async fn insert_sequence_run(&self, run: &SequenceRun) -> Result<bool, DatabaseError> {
        let cart = run.cart.as_ref().map(to_json).transpose()?;
        let inserted = self
            .exec(
                "insert_sequence_run",
                "INSERT INTO sequence_runs
                    (id, workspace_id, client_id, conversation_id, family, status, current_step, next_fire_at, started_at, completed_at, cart)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT DO NOTHING",
                params![
                    run.id.to_string(),
                    run.workspace_id.to_string(),
                    run.client_id.to_string(),
                    opt_text(run.conversation_id.map(|c| c.to_string()).as_deref()),
                    run.family.as_str(),
                    run.status.as_str(),
                    run.current_step,
                    opt_ts(run.next_fire_at.as_ref()),
                    fmt_ts(&run.started_at),
                    opt_ts(run.completed_at.as_ref()),
                    opt_text(cart.as_deref()),
                ],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn get_sequence_run(&self, id: Uuid) -> Result<Option<SequenceRun>, DatabaseError> {
        self.query_one(
            "get_sequence_run",
            &format!("SELECT {RUN_COLUMNS} FROM sequence_runs WHERE id = ?1"),
            params![id.to_string()],
            row_to_run,
        )
        .await
    }

    async fn open_follow_up(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<SequenceRun>, DatabaseError> {
        self.query_one(
            "open_follow_up",
            &format!(
                "SELECT {RUN_COLUMNS} FROM sequence_runs
                 WHERE workspace_id = ?1 AND client_id = ?2 AND family = 'follow_up'
                   AND status IN ('active', 'paused')"
            ),
            params![workspace_id.to_string(), client_id.to_string()],
            row_to_run,
        )
        .await
    }

    async fn latest_cart_run(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<SequenceRun>, DatabaseError> {
        self.query_one(
            "latest_cart_run",
            &format!(
                "SELECT {RUN_COLUMNS} FROM sequence_runs
                 WHERE conversation_id = ?1 AND family = 'abandoned_cart'
                 ORDER BY started_at DESC, rowid DESC LIMIT 1"
            ),
            params![conversation_id.to_string()],
            row_to_run,
        )
        .await
    }

    async fn advance_sequence_run(
        &self,
        id: Uuid,
        expected_step: i64,
        next_fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .exec(
                "advance_sequence_run",
                "UPDATE sequence_runs SET current_step = current_step + 1, next_fire_at = ?3
                 WHERE id = ?1 AND status = 'active' AND current_step = ?2",
                params![id.to_string(), expected_step, fmt_ts(&next_fire_at)],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn transition_sequence_run(
        &self,
        id: Uuid,
        from: SequenceStatus,
        to: SequenceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let terminal = to.is_terminal();
        let updated = self
            .exec(
                "transition_sequence_run",
                "UPDATE sequence_runs SET
                    status = ?3,
                    completed_at = CASE WHEN ?4 = 1 THEN ?5 ELSE completed_at END,
                    next_fire_at = CASE WHEN ?4 = 1 THEN NULL ELSE next_fire_at END,
                    paused_at = CASE WHEN ?3 = 'paused' THEN ?5 ELSE NULL END
                 WHERE id = ?1 AND status = ?2",
                params![
                    id.to_string(),
                    from.as_str(),
                    to.as_str(),
                    i64::from(terminal),
                    fmt_ts(&now),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn set_sequence_next_fire(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_sequence_next_fire",
            "UPDATE sequence_runs SET next_fire_at = ?2 WHERE id = ?1",
            params![id.to_string(), opt_ts(next_fire_at.as_ref())],
        )
        .await?;
        Ok(())
    }

    async fn cancel_active_cart_runs(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        self.query_rows(
            "cancel_active_cart_runs",
            "UPDATE sequence_runs SET status = 'cancelled', completed_at = ?2, next_fire_at = NULL
             WHERE conversation_id = ?1 AND family = 'abandoned_cart' AND status = 'active'
             RETURNING id",
            params![conversation_id.to_string(), fmt_ts(&now)],
            |row| uuid_col(row, 0),
        )
        .await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        queue: &str,
        id: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "enqueue_job",
                "INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    queue = excluded.queue,
                    payload = excluded.payload,
                    status = 'pending',
                    attempts = 0,
                    max_attempts = excluded.max_attempts,
                    run_at = excluded.run_at,
                    locked_until = NULL,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                 WHERE jobs.status IN ('completed', 'skipped', 'failed')",
                params![
                    id,
                    queue,
                    to_json(payload)?,
                    i64::from(max_attempts),
                    fmt_ts(&run_at),
                    fmt_ts(&now),
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn claim_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, DatabaseError> {
        self.query_one(
            "claim_job",
            &format!(
                "UPDATE jobs SET
                    status = 'processing',
                    attempts = attempts + 1,
                    locked_until = ?3,
                    updated_at = ?2
                 WHERE id = (
                    SELECT id FROM jobs
                    WHERE queue = ?1 AND status = 'pending' AND run_at <= ?2
                    ORDER BY run_at ASC, created_at ASC
                    LIMIT 1
                 ) AND status = 'pending'
                 RETURNING {JOB_COLUMNS}"
            ),
            params![queue, fmt_ts(&now), fmt_ts(&locked_until)],
            row_to_job,
        )
        .await
    }

    async fn recover_stalled_jobs(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.exec(
            "recover_stalled_jobs",
            "UPDATE jobs SET
                status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = CASE WHEN attempts >= max_attempts THEN 'stalled: lock expired' ELSE last_error END,
                run_at = CASE WHEN attempts >= max_attempts THEN run_at ELSE ?2 END,
                locked_until = NULL,
                updated_at = ?2
             WHERE queue = ?1 AND status = 'processing' AND locked_until < ?2",
            params![queue, fmt_ts(&now)],
        )
        .await
    }

    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "finish_job",
            "UPDATE jobs SET status = ?2, last_error = ?3, locked_until = NULL, updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), opt_text(note), fmt_ts(&now)],
        )
        .await?;
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        error: Option<&str>,
        refund_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "reschedule_job",
            "UPDATE jobs SET
                status = 'pending',
                run_at = ?2,
                last_error = COALESCE(?3, last_error),
                attempts = CASE WHEN ?4 = 1 THEN MAX(attempts - 1, 0) ELSE attempts END,
                locked_until = NULL,
                updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                fmt_ts(&run_at),
                opt_text(error),
                i64::from(refund_attempt),
                fmt_ts(&now),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        self.query_one(
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )
        .await
    }

    async fn list_jobs(&self, queue: &str) -> Result<Vec<JobRecord>, DatabaseError> {
        self.query_rows(
            "list_jobs",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 ORDER BY created_at ASC, id ASC"),
            params![queue],
            row_to_job,
        )
        .await
    }
}
