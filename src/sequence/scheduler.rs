//! Sequence scheduler: drives follow-up and abandoned-cart runs through their
//! ordered rules with self-rescheduling delayed jobs.
//!
//! Cancellation is lazy. Nothing ever removes a queued step job; convert,
//! cancel and pause only flip the run's status, and the next firing sees a
//! non-active run and does nothing. Every step write is a compare-and-set on
//! `(status = active, current_step = k)`.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::ResponseGenerator;
use crate::error::{JobError, SequenceError};
use crate::notify::Gateway;
use crate::pipeline::outbound::Outbox;
use crate::queue::{JobHandler, JobOutcome, JobQueue, JobRecord, JobSpec};
use crate::sequence::model::{
    CartDetails, SequenceFamily, SequenceRule, SequenceRun, SequenceStatus, SequenceStepJob,
    StepTarget,
};
use crate::store::model::{Client, SenderKind};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").expect("static regex"));

/// Messages of history handed to the generator for a sequence step.
const SEQUENCE_HISTORY_WINDOW: usize = 10;

/// Substitute `{{name}}`, `{{phone}}`, `{{cart_url}}` and `{{cart_total}}`.
/// Unknown placeholders are left as written.
pub fn render_template(template: &str, client: &Client, cart: Option<&CartDetails>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let value = match &caps[1] {
                "name" => Some(
                    client
                        .display_name
                        .clone()
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| "there".to_string()),
                ),
                "phone" => Some(client.phone_number.clone()),
                "cart_url" => Some(cart.and_then(|c| c.cart_url.clone()).unwrap_or_default()),
                "cart_total" => Some(
                    cart.and_then(|c| c.total)
                        .map(|t| format!("{:.2}", t.round_dp(2)))
                        .unwrap_or_default(),
                ),
                _ => None,
            };
            value.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn to_std(d: chrono::Duration) -> std::time::Duration {
    d.to_std().unwrap_or_default()
}

pub struct SequenceScheduler {
    gateway: Arc<Gateway>,
    queue: Arc<JobQueue>,
    generator: Arc<ResponseGenerator>,
    outbox: Arc<Outbox>,
}

impl SequenceScheduler {
    pub fn new(
        gateway: Arc<Gateway>,
        queue: Arc<JobQueue>,
        generator: Arc<ResponseGenerator>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            gateway,
            queue,
            generator,
            outbox,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Start the inactivity follow-up for a client. A no-op returning `None`
    /// when the workspace has no rules or the client already has an open run.
    pub async fn start_follow_up(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<SequenceRun>, SequenceError> {
        let db = self.gateway.db();
        if let Some(open) = db.open_follow_up(workspace_id, client_id).await? {
            debug!(follow_up_id = %open.id, client_id = %client_id, "Follow-up already open");
            return Ok(None);
        }
        let run = SequenceRun::new(
            workspace_id,
            client_id,
            conversation_id,
            SequenceFamily::FollowUp,
            self.gateway.now(),
        );
        self.launch(run).await
    }

    /// Start cart recovery for a conversation. Any active cart run on the
    /// conversation is cancelled and replaced.
    pub async fn start_abandoned_cart(
        &self,
        workspace_id: Uuid,
        client_id: Uuid,
        conversation_id: Uuid,
        cart: CartDetails,
    ) -> Result<Option<SequenceRun>, SequenceError> {
        self.cancel_cart_runs(conversation_id).await?;
        let mut run = SequenceRun::new(
            workspace_id,
            client_id,
            Some(conversation_id),
            SequenceFamily::AbandonedCart,
            self.gateway.now(),
        );
        run.cart = Some(cart);
        self.launch(run).await
    }

    async fn launch(&self, mut run: SequenceRun) -> Result<Option<SequenceRun>, SequenceError> {
        let rules = self
            .gateway
            .db()
            .list_sequence_rules(run.workspace_id, run.family)
            .await?;
        let Some(first) = rules.first() else {
            debug!(workspace_id = %run.workspace_id, family = %run.family, "No sequence rules, nothing started");
            return Ok(None);
        };

        run.next_fire_at = Some(run.started_at + first.delay());
        if !self.gateway.db().insert_sequence_run(&run).await? {
            debug!(client_id = %run.client_id, family = %run.family, "Concurrent start won, skipping");
            return Ok(None);
        }

        self.schedule_step(&run, first, first.delay()).await?;
        info!(
            follow_up_id = %run.id,
            family = %run.family,
            steps = rules.len(),
            "Sequence started"
        );
        self.gateway.sequence_updated(&run);
        Ok(Some(run))
    }

    async fn schedule_step(
        &self,
        run: &SequenceRun,
        rule: &SequenceRule,
        delay: chrono::Duration,
    ) -> Result<(), SequenceError> {
        let Some(step) = SequenceStepJob::for_run(run, rule.id) else {
            warn!(follow_up_id = %run.id, "Cart run without conversation, step not scheduled");
            return Ok(());
        };
        let spec = JobSpec::new(step.job_id(), &step)?.delayed(to_std(delay));
        self.queue.enqueue(spec).await?;
        Ok(())
    }

    /// Cancel active cart runs on a conversation after customer activity.
    pub async fn cancel_cart_runs(&self, conversation_id: Uuid) -> Result<usize, SequenceError> {
        let db = self.gateway.db();
        let cancelled = db
            .cancel_active_cart_runs(conversation_id, self.gateway.now())
            .await?;
        for id in &cancelled {
            info!(follow_up_id = %id, conversation_id = %conversation_id, "Cart recovery cancelled by activity");
            if let Some(run) = db.get_sequence_run(*id).await? {
                self.gateway.sequence_updated(&run);
            }
        }
        Ok(cancelled.len())
    }

    async fn load(&self, id: Uuid) -> Result<SequenceRun, SequenceError> {
        self.gateway
            .db()
            .get_sequence_run(id)
            .await?
            .ok_or(SequenceError::NotFound(id))
    }

    /// Validated manual transition.
    async fn transition(
        &self,
        id: Uuid,
        target: SequenceStatus,
    ) -> Result<SequenceRun, SequenceError> {
        let run = self.load(id).await?;
        if !run.status.can_transition_to(target) {
            return Err(SequenceError::InvalidTransition {
                id,
                from: run.status.to_string(),
                to: target.to_string(),
            });
        }
        let moved = self
            .gateway
            .db()
            .transition_sequence_run(id, run.status, target, self.gateway.now())
            .await?;
        let current = self.load(id).await?;
        if !moved {
            return Err(SequenceError::InvalidTransition {
                id,
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }
        info!(follow_up_id = %id, from = %run.status, to = %target, "Sequence transitioned");
        self.gateway.sequence_updated(&current);
        Ok(current)
    }

    pub async fn convert(&self, id: Uuid) -> Result<SequenceRun, SequenceError> {
        self.transition(id, SequenceStatus::Converted).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<SequenceRun, SequenceError> {
        self.transition(id, SequenceStatus::Cancelled).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<SequenceRun, SequenceError> {
        self.transition(id, SequenceStatus::Paused).await
    }

    /// Resume a paused run and re-arm its current step with the delay that
    /// was left when it was paused. Time spent paused does not count.
    pub async fn resume(&self, id: Uuid) -> Result<SequenceRun, SequenceError> {
        let paused = self.load(id).await?;
        let remaining = match (paused.next_fire_at, paused.paused_at) {
            (Some(at), Some(paused_at)) => at - paused_at,
            (Some(at), None) => at - self.gateway.now(),
            (None, _) => chrono::Duration::zero(),
        }
        .max(chrono::Duration::zero());

        let mut run = self.transition(id, SequenceStatus::Active).await?;
        let now = self.gateway.now();
        let rules = self
            .gateway
            .db()
            .list_sequence_rules(run.workspace_id, run.family)
            .await?;

        let step = usize::try_from(run.current_step).unwrap_or(usize::MAX);
        let Some(rule) = rules.get(step) else {
            return self.complete(&run).await;
        };

        let fire_at = now + remaining;
        self.gateway
            .db()
            .set_sequence_next_fire(run.id, Some(fire_at))
            .await?;
        run.next_fire_at = Some(fire_at);
        self.schedule_step(&run, rule, remaining).await?;
        Ok(run)
    }

    async fn complete(&self, run: &SequenceRun) -> Result<SequenceRun, SequenceError> {
        self.gateway
            .db()
            .transition_sequence_run(
                run.id,
                SequenceStatus::Active,
                SequenceStatus::Completed,
                self.gateway.now(),
            )
            .await?;
        let done = self.load(run.id).await?;
        info!(follow_up_id = %run.id, status = %done.status, "Sequence finished");
        self.gateway.sequence_updated(&done);
        Ok(done)
    }

    async fn mark_failed(&self, run: &SequenceRun, reason: &str) -> Result<(), SequenceError> {
        warn!(follow_up_id = %run.id, reason, "Sequence failed");
        let moved = self
            .gateway
            .db()
            .transition_sequence_run(
                run.id,
                run.status,
                SequenceStatus::Failed,
                self.gateway.now(),
            )
            .await?;
        if moved {
            let failed = self.load(run.id).await?;
            self.gateway.sequence_updated(&failed);
        }
        Ok(())
    }

    async fn run_for(&self, step: &SequenceStepJob) -> Result<Option<SequenceRun>, SequenceError> {
        let db = self.gateway.db();
        Ok(match step.target {
            StepTarget::FollowUp { follow_up_id } => db.get_sequence_run(follow_up_id).await?,
            StepTarget::Cart { conversation_id } => db.latest_cart_run(conversation_id).await?,
        })
    }

    /// Handle one fired step job.
    pub async fn advance(&self, step: &SequenceStepJob) -> Result<JobOutcome, SequenceError> {
        let Some(run) = self.run_for(step).await? else {
            return Err(match step.target {
                StepTarget::FollowUp { follow_up_id } => SequenceError::NotFound(follow_up_id),
                StepTarget::Cart { conversation_id } => SequenceError::NotFound(conversation_id),
            });
        };
        if run.status != SequenceStatus::Active {
            debug!(follow_up_id = %run.id, status = %run.status, "Run not active, step dropped");
            return Ok(JobOutcome::Skipped(format!("run is {}", run.status)));
        }

        let db = self.gateway.db();
        let rules = db.list_sequence_rules(run.workspace_id, run.family).await?;
        let index = usize::try_from(run.current_step).unwrap_or(usize::MAX);
        let Some(rule) = rules.get(index) else {
            self.complete(&run).await?;
            return Ok(JobOutcome::Skipped("no rule at current step".into()));
        };
        if rule.id != step.rule_id {
            debug!(follow_up_id = %run.id, rule_id = %step.rule_id, expected = %rule.id, "Stale step job");
            return Ok(JobOutcome::Skipped("stale step".into()));
        }

        let now = self.gateway.now();
        if let Some(at) = run.next_fire_at.filter(|at| *at > now) {
            return Ok(JobOutcome::Deferred(at));
        }

        let Some(conversation_id) = run.conversation_id else {
            self.mark_failed(&run, "run has no conversation").await?;
            return Ok(JobOutcome::Skipped("run has no conversation".into()));
        };

        if run.family == SequenceFamily::FollowUp {
            if let Some(last) = db.latest_message_at(conversation_id, SenderKind::Client).await? {
                let quiet_until = last + rule.delay();
                if quiet_until > now {
                    debug!(follow_up_id = %run.id, until = %quiet_until, "Client active recently, step deferred");
                    db.set_sequence_next_fire(run.id, Some(quiet_until)).await?;
                    return Ok(JobOutcome::Deferred(quiet_until));
                }
            }
        }

        let Some(conversation) = db.get_conversation(conversation_id).await? else {
            return Err(SequenceError::NotFound(conversation_id));
        };
        let Some(client) = db.get_client(run.client_id).await? else {
            return Err(SequenceError::NotFound(run.client_id));
        };
        let Some(workspace) = db.get_workspace(run.workspace_id).await? else {
            return Err(SequenceError::NotFound(run.workspace_id));
        };

        let instruction = render_template(&rule.instruction, &client, run.cart.as_ref());
        let history = db
            .recent_messages(conversation.id, SEQUENCE_HISTORY_WINDOW)
            .await?;
        let text = match self
            .generator
            .compose_sequence_message(&workspace, &history, &instruction)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(follow_up_id = %run.id, error = %e, "Sequence generation failed, sending rule text");
                instruction
            }
        };

        // Last look before anything leaves: a convert/cancel that landed
        // during generation wins.
        let fresh = self.load(run.id).await?;
        if fresh.status != SequenceStatus::Active || fresh.current_step != run.current_step {
            return Ok(JobOutcome::Skipped(format!("run is {}", fresh.status)));
        }

        let message = self
            .outbox
            .deliver(
                &conversation,
                &client,
                &text,
                Some(json!({
                    "sequenceRunId": run.id,
                    "ruleId": rule.id,
                    "family": run.family,
                    "step": run.current_step,
                })),
            )
            .await?;
        info!(
            follow_up_id = %run.id,
            step = run.current_step,
            message_id = %message.id,
            status = %message.status,
            "Sequence step sent"
        );

        match rules.get(index + 1) {
            Some(next) => {
                let fire_at = self.gateway.now() + next.delay();
                if !db
                    .advance_sequence_run(run.id, run.current_step, fire_at)
                    .await?
                {
                    warn!(follow_up_id = %run.id, "Run changed during step, not rescheduling");
                    return Ok(JobOutcome::Completed);
                }
                let mut advanced = run.clone();
                advanced.current_step += 1;
                advanced.next_fire_at = Some(fire_at);
                self.schedule_step(&advanced, next, next.delay()).await?;
                self.gateway.sequence_updated(&advanced);
            }
            None => {
                self.complete(&run).await?;
            }
        }
        Ok(JobOutcome::Completed)
    }

    /// When the run's next step is due, if it is active.
    pub async fn next_fire_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, SequenceError> {
        Ok(self.load(id).await?.next_fire_at)
    }
}

#[async_trait]
impl JobHandler for SequenceScheduler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, JobError> {
        let step: SequenceStepJob = job.payload_as()?;
        Ok(self.advance(&step).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::Clock;
    use crate::queue::JobStatus;
    use crate::store::model::{DeliveryStatus, NewMessage};
    use crate::testing::{Harness, Scripted};

    async fn rules(h: &Harness, family: SequenceFamily, steps: &[(i64, &str)]) -> Vec<SequenceRule> {
        let mut out = Vec::new();
        for (pos, (hours, text)) in steps.iter().enumerate() {
            let rule = SequenceRule::new(h.workspace.id, family, Duration::hours(*hours), *text, pos as i64);
            h.db.insert_sequence_rule(&rule).await.unwrap();
            out.push(rule);
        }
        out
    }

    #[tokio::test]
    async fn chain_of_k_rules_sends_k_messages_then_completes() {
        let h = Harness::new([Scripted::text("A text"), Scripted::text("B text")]).await;
        rules(&h, SequenceFamily::FollowUp, &[(1, "A"), (2, "B")]).await;
        let (client, conv) = h.client_conversation("5511").await;

        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.next_fire_at, Some(h.clock.now() + Duration::hours(1)));

        // Not due yet.
        assert!(h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().is_none());

        h.clock.advance(Duration::hours(1));
        let a = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Completed);
        let mid = h.db.get_sequence_run(run.id).await.unwrap().unwrap();
        assert_eq!(mid.current_step, 1);
        assert_eq!(mid.next_fire_at, Some(h.clock.now() + Duration::hours(2)));

        h.clock.advance(Duration::hours(2));
        h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();

        let done = h.db.get_sequence_run(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, SequenceStatus::Completed);
        assert!(done.next_fire_at.is_none());
        let texts: Vec<String> = h.adapter.sent().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["A text".to_string(), "B text".to_string()]);
    }

    #[tokio::test]
    async fn convert_before_second_step_stops_the_sequence() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::FollowUp, &[(1, "A"), (2, "B")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::hours(1));
        h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(h.adapter.sent().len(), 1);

        let converted = h.scheduler.convert(run.id).await.unwrap();
        assert_eq!(converted.status, SequenceStatus::Converted);

        h.clock.advance(Duration::hours(2));
        let b = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Skipped);
        assert_eq!(h.adapter.sent().len(), 1);

        let after = h.db.get_sequence_run(run.id).await.unwrap().unwrap();
        assert_eq!(after.current_step, 1);
    }

    #[tokio::test]
    async fn second_start_is_a_noop_while_open() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::FollowUp, &[(1, "A")]).await;
        let (client, conv) = h.client_conversation("5511").await;

        assert!(h.scheduler.start_follow_up(h.workspace.id, client.id, Some(conv.id)).await.unwrap().is_some());
        assert!(h.scheduler.start_follow_up(h.workspace.id, client.id, Some(conv.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_rules_means_no_run() {
        let h = Harness::new([]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let started = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap();
        assert!(started.is_none());
        assert!(h.db.open_follow_up(h.workspace.id, client.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_client_activity_defers_the_step() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::FollowUp, &[(1, "A")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::minutes(50));
        h.db.insert_message(&NewMessage::new(
            conv.id,
            SenderKind::Client,
            "still thinking",
            h.clock.now(),
            DeliveryStatus::Sent,
        ))
        .await
        .unwrap();
        let spoke_at = h.clock.now();

        h.clock.advance(Duration::minutes(10));
        let deferred = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(deferred.status, JobStatus::Pending);
        let row = h.sequence_queue.get(&deferred.id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 0);
        assert!(h.adapter.sent().is_empty());
        assert_eq!(
            h.scheduler.next_fire_at(run.id).await.unwrap(),
            Some(spoke_at + Duration::hours(1))
        );

        h.clock.set(spoke_at + Duration::hours(1));
        let sent = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(sent.status, JobStatus::Completed);
        assert_eq!(h.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_falls_back_to_rendered_rule_text() {
        let h = Harness::new([Scripted::Fail]).await;
        rules(&h, SequenceFamily::AbandonedCart, &[(1, "Hi {{name}}, your cart ({{cart_total}}) is waiting: {{cart_url}}")]).await;
        let (client, conv) = h.client_conversation("5511").await;

        let run = h
            .scheduler
            .start_abandoned_cart(
                h.workspace.id,
                client.id,
                conv.id,
                CartDetails {
                    cart_url: Some("https://shop/cart/1".into()),
                    total: Some(dec!(149.9)),
                    items: vec![],
                },
            )
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::hours(1));
        let job = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert!(job.id.starts_with(&format!("acart_{}_rule_", conv.id)));

        let sent = h.adapter.sent();
        assert_eq!(sent[0].1, "Hi Ana, your cart (149.90) is waiting: https://shop/cart/1");
        let done = h.db.get_sequence_run(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn customer_activity_cancels_cart_recovery() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::AbandonedCart, &[(1, "come back")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_abandoned_cart(h.workspace.id, client.id, conv.id, CartDetails::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.scheduler.cancel_cart_runs(conv.id).await.unwrap(), 1);
        h.clock.advance(Duration::hours(1));
        let job = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Skipped);
        assert!(h.adapter.sent().is_empty());
        let cancelled = h.db.get_sequence_run(run.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, SequenceStatus::Cancelled);
    }

    #[tokio::test]
    async fn restarted_cart_defers_the_old_timer() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::AbandonedCart, &[(1, "come back")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        h.scheduler
            .start_abandoned_cart(h.workspace.id, client.id, conv.id, CartDetails::default())
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::minutes(30));
        let second = h
            .scheduler
            .start_abandoned_cart(h.workspace.id, client.id, conv.id, CartDetails::default())
            .await
            .unwrap()
            .unwrap();

        // The first run's timer fires but belongs to the replacement now.
        h.clock.advance(Duration::minutes(30));
        let early = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(early.status, JobStatus::Pending);
        assert!(h.adapter.sent().is_empty());

        h.clock.set(second.next_fire_at.unwrap());
        h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(h.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_keep_remaining_delay() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::FollowUp, &[(2, "A")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();
        let started = run.started_at;

        h.clock.advance(Duration::hours(1));
        let paused = h.scheduler.pause(run.id).await.unwrap();
        assert_eq!(paused.paused_at, Some(h.clock.now()));

        // The original timer fires while paused and is dropped.
        h.clock.advance(Duration::hours(2));
        let dropped = h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(dropped.status, JobStatus::Skipped);

        // One hour was left at pause time; three hours later that hour still remains.
        let resumed = h.scheduler.resume(run.id).await.unwrap();
        assert_eq!(resumed.status, SequenceStatus::Active);
        assert_eq!(resumed.paused_at, None);
        assert_eq!(resumed.next_fire_at, Some(started + Duration::hours(4)));
        assert!(h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().is_none());
        assert!(h.adapter.sent().is_empty());

        h.clock.advance(Duration::hours(1));
        h.sequence_queue.process_next(h.scheduler.as_ref()).await.unwrap().unwrap();
        assert_eq!(h.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn resume_does_not_count_a_short_pause() {
        let h = Harness::new([]).await;
        let chain = rules(&h, SequenceFamily::FollowUp, &[(2, "A")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::hours(1));
        h.scheduler.pause(run.id).await.unwrap();
        h.clock.advance(Duration::minutes(30));
        let resumed = h.scheduler.resume(run.id).await.unwrap();

        assert_eq!(
            resumed.next_fire_at,
            Some(run.started_at + Duration::minutes(150))
        );
        let job = h
            .sequence_queue
            .get(&SequenceStepJob::for_run(&resumed, chain[0].id).unwrap().job_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.run_at, run.started_at + Duration::minutes(150));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let h = Harness::new([]).await;
        rules(&h, SequenceFamily::FollowUp, &[(1, "A")]).await;
        let (client, conv) = h.client_conversation("5511").await;
        let run = h
            .scheduler
            .start_follow_up(h.workspace.id, client.id, Some(conv.id))
            .await
            .unwrap()
            .unwrap();

        h.scheduler.cancel(run.id).await.unwrap();
        let err = h.scheduler.convert(run.id).await.unwrap_err();
        assert!(matches!(err, SequenceError::InvalidTransition { .. }));
        assert!(matches!(
            h.scheduler.resume(Uuid::new_v4()).await.unwrap_err(),
            SequenceError::NotFound(_)
        ));
    }

    #[test]
    fn unknown_placeholders_survive() {
        let client = Client {
            id: Uuid::nil(),
            workspace_id: Uuid::nil(),
            channel: crate::channels::ChannelKind::Evolution,
            external_id: None,
            phone_number: "5511".into(),
            display_name: None,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            render_template("Hey {{ name }} ({{phone}}) {{coupon}}", &client, None),
            "Hey there (5511) {{coupon}}"
        );
    }
}
