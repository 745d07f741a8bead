//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every concurrency invariant of the engine lives here as a uniqueness
//! constraint or a conditional update, never as an in-process lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ai::stage::Stage;
use crate::channels::{ChannelCredentials, ChannelKind};
use crate::error::DatabaseError;
use crate::queue::job::{JobRecord, JobStatus};
use crate::sequence::model::{SequenceFamily, SequenceRule, SequenceRun, SequenceStatus};
use crate::store::model::{
    Client, Conversation, ConversationContext, DeliveryStatus, Message, MessageCursor, NewMessage,
    SenderKind, Workspace,
};

/// Fields for a client upsert keyed by `(workspace, phone, channel)`.
#[derive(Debug, Clone)]
pub struct ClientUpsert<'a> {
    pub workspace_id: Uuid,
    pub phone_number: &'a str,
    pub channel: ChannelKind,
    pub display_name: Option<&'a str>,
    pub external_id: Option<&'a str>,
    /// Shallow-merged over the stored metadata on every contact.
    pub metadata: Option<&'a serde_json::Value>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workspaces ──────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError>;

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError>;

    async fn upsert_channel_credentials(
        &self,
        workspace_id: Uuid,
        credentials: &ChannelCredentials,
    ) -> Result<(), DatabaseError>;

    async fn get_channel_credentials(
        &self,
        workspace_id: Uuid,
        channel: ChannelKind,
    ) -> Result<Option<ChannelCredentials>, DatabaseError>;

    async fn insert_sequence_rule(&self, rule: &SequenceRule) -> Result<(), DatabaseError>;

    /// Rules of one family in firing order: ascending delay for follow-ups,
    /// ascending position for abandoned carts.
    async fn list_sequence_rules(
        &self,
        workspace_id: Uuid,
        family: SequenceFamily,
    ) -> Result<Vec<SequenceRule>, DatabaseError>;

    async fn upsert_stage(&self, stage: &Stage) -> Result<(), DatabaseError>;

    async fn list_active_stages(&self, workspace_id: Uuid) -> Result<Vec<Stage>, DatabaseError>;

    // ── Clients & conversations ─────────────────────────────────────

    /// Insert-or-update a client. The flag is true only for the call whose
    /// insert won the unique key.
    async fn upsert_client(
        &self,
        upsert: &ClientUpsert<'_>,
        now: DateTime<Utc>,
    ) -> Result<(Client, bool), DatabaseError>;

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, DatabaseError>;

    /// Find-or-create the conversation for `(workspace, client, channel)`.
    /// An existing row is reactivated and its activity timestamp refreshed.
    async fn upsert_conversation(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
        channel: ChannelKind,
        ai_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool), DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Move `last_activity_at` forward to `now` (never backwards).
    async fn touch_conversation(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn set_conversation_ai_enabled(&self, id: Uuid, enabled: bool)
    -> Result<(), DatabaseError>;

    async fn close_conversation(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn update_conversation_context(
        &self,
        id: Uuid,
        context: &ConversationContext,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message. The stored timestamp is clamped to be no earlier than
    /// the conversation's latest message. Returns `None` when a client message
    /// with the same provider id already exists in the conversation.
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<Message>, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    async fn update_message_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Timestamp of the newest message from `sender` in the conversation.
    async fn latest_message_at(
        &self,
        conversation_id: Uuid,
        sender: SenderKind,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Order position of the newest message from `sender` in the conversation.
    async fn latest_message_cursor(
        &self,
        conversation_id: Uuid,
        sender: SenderKind,
    ) -> Result<Option<MessageCursor>, DatabaseError>;

    /// Client messages ordered after `after` (all of them when `None`),
    /// oldest first. Equal timestamps compare by insert order.
    async fn client_messages_after(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// The most recent `limit` messages, returned oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Sequence runs ───────────────────────────────────────────────

    /// Insert a run. Returns false when another `active`/`paused` run already
    /// holds the family's uniqueness slot.
    async fn insert_sequence_run(&self, run: &SequenceRun) -> Result<bool, DatabaseError>;

    async fn get_sequence_run(&self, id: Uuid) -> Result<Option<SequenceRun>, DatabaseError>;

    /// The client's `active` or `paused` follow-up run, if any.
    async fn open_follow_up(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<SequenceRun>, DatabaseError>;

    /// Most recently started cart run for the conversation, any status.
    async fn latest_cart_run(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<SequenceRun>, DatabaseError>;

    /// Compare-and-set step advance: applies only while the run is `active`
    /// at `expected_step`.
    async fn advance_sequence_run(
        &self,
        id: Uuid,
        expected_step: i64,
        next_fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-set status change from `from` to `to`. Terminal targets
    /// stamp `completed_at` and clear `next_fire_at`.
    async fn transition_sequence_run(
        &self,
        id: Uuid,
        from: SequenceStatus,
        to: SequenceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn set_sequence_next_fire(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Cancel every `active` cart run on a conversation, returning their ids.
    async fn cancel_active_cart_runs(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a pending job, or revive a finished one with the same id.
    /// Returns false when the id is already pending or processing.
    async fn enqueue_job(
        &self,
        queue: &str,
        id: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Atomically claim the earliest due pending job, bumping its attempt count.
    async fn claim_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, DatabaseError>;

    /// Return expired `processing` jobs to `pending`, or fail them when out of
    /// attempts. Returns the number of rows touched.
    async fn recover_stalled_jobs(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Record a terminal outcome (`completed`, `skipped`, `failed`).
    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Put a claimed job back to `pending` for `run_at`. When `refund_attempt`
    /// is set the claim does not count towards `max_attempts`.
    async fn reschedule_job(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        error: Option<&str>,
        refund_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, DatabaseError>;

    async fn list_jobs(&self, queue: &str) -> Result<Vec<JobRecord>, DatabaseError>;
}
