//! Durable delayed-job queue backed by the `jobs` table.
//!
//! One `JobQueue` per responsibility, each constructed with its own
//! `QueuePolicy`. Job ids are caller-chosen so re-enqueueing the same logical
//! job collapses onto one row.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{JobError, QueueError};
use crate::store::Database;

/// Lifecycle of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Claims so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Decode the payload. A malformed payload can never succeed, so it is fatal.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::fatal(format!("malformed payload for job {}: {e}", self.id)))
    }
}

/// What a handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work was done.
    Completed,
    /// Nothing to do; the reason is logged and stored.
    Skipped(String),
    /// Not yet; run the same job again at the given time without using an attempt.
    Deferred(DateTime<Utc>),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, JobError>;
}

/// Per-queue concurrency and retry policy.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub concurrency: usize,
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    /// How long a claim may run before the job is considered stalled.
    pub stall_timeout: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub payload: serde_json::Value,
    pub delay: Duration,
}

impl JobSpec {
    pub fn new<T: Serialize>(id: impl Into<String>, payload: &T) -> Result<Self, QueueError> {
        Ok(Self {
            id: id.into(),
            payload: serde_json::to_value(payload)?,
            delay: Duration::ZERO,
        })
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Result of one `process_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub id: String,
    /// Row status after processing; `Pending` means retried or deferred.
    pub status: JobStatus,
    pub attempts: u32,
}

pub struct JobQueue {
    name: String,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    wake: Arc<Notify>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

impl JobQueue {
    pub fn new(
        name: impl Into<String>,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            db,
            clock,
            policy,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Signalled on every enqueue so idle workers pick the job up early.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Enqueue `spec` to run after its delay. Returns false when a job with the
    /// same id is already pending or processing.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let run_at = now + to_chrono(spec.delay);
        self.enqueue_at(&spec.id, &spec.payload, run_at).await
    }

    pub async fn enqueue_at(
        &self,
        id: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let queued = self
            .db
            .enqueue_job(&self.name, id, payload, run_at, self.policy.max_attempts, now)
            .await?;
        if queued {
            debug!(queue = %self.name, job_id = id, run_at = %run_at, "Job enqueued");
            self.wake.notify_waiters();
        } else {
            debug!(queue = %self.name, job_id = id, "Job already queued, enqueue ignored");
        }
        Ok(queued)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.db.get_job(id).await?)
    }

    /// Delay before retry number `attempts` (1-based), with up to 20% jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self.policy.backoff_base.saturating_mul(1u32 << exp);
        let jitter_cap = (base.as_millis() / 5) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }

    /// Return stalled jobs to the queue.
    pub async fn recover_stalled(&self) -> Result<u64, QueueError> {
        let recovered = self
            .db
            .recover_stalled_jobs(&self.name, self.clock.now())
            .await?;
        if recovered > 0 {
            warn!(queue = %self.name, count = recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    /// Claim and run the next due job using the injected clock.
    pub async fn process_next(
        &self,
        handler: &dyn JobHandler,
    ) -> Result<Option<ProcessedJob>, QueueError> {
        self.process_next_at(handler, self.clock.now()).await
    }

    /// Claim and run the next job due at `now`.
    pub async fn process_next_at(
        &self,
        handler: &dyn JobHandler,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessedJob>, QueueError> {
        let locked_until = now + to_chrono(self.policy.stall_timeout);
        let Some(job) = self.db.claim_job(&self.name, now, locked_until).await? else {
            return Ok(None);
        };

        let result = handler.handle(&job).await;
        let finished_at = self.clock.now().max(now);

        let status = match result {
            Ok(JobOutcome::Completed) => {
                self.db
                    .finish_job(&job.id, JobStatus::Completed, None, finished_at)
                    .await?;
                info!(queue = %self.name, job_id = %job.id, attempts = job.attempts, "Job completed");
                JobStatus::Completed
            }
            Ok(JobOutcome::Skipped(reason)) => {
                self.db
                    .finish_job(&job.id, JobStatus::Skipped, Some(&reason), finished_at)
                    .await?;
                debug!(queue = %self.name, job_id = %job.id, reason = %reason, "Job skipped");
                JobStatus::Skipped
            }
            Ok(JobOutcome::Deferred(run_at)) => {
                self.db
                    .reschedule_job(&job.id, run_at, None, true, finished_at)
                    .await?;
                debug!(queue = %self.name, job_id = %job.id, run_at = %run_at, "Job deferred");
                JobStatus::Pending
            }
            Err(e) if e.retryable && job.attempts < job.max_attempts => {
                let delay = self.backoff(job.attempts);
                let run_at = finished_at + to_chrono(delay);
                self.db
                    .reschedule_job(&job.id, run_at, Some(&e.reason), false, finished_at)
                    .await?;
                warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying"
                );
                JobStatus::Pending
            }
            Err(e) => {
                self.db
                    .finish_job(&job.id, JobStatus::Failed, Some(&e.reason), finished_at)
                    .await?;
                error!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    retryable = e.retryable,
                    error = %e,
                    "Job abandoned"
                );
                JobStatus::Failed
            }
        };

        Ok(Some(ProcessedJob {
            id: job.id,
            status,
            attempts: job.attempts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlBackend;

    struct Scripted {
        calls: AtomicU32,
        outcomes: Mutex<Vec<Result<JobOutcome, JobError>>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<JobOutcome, JobError>>) -> Self {
            outcomes.reverse();
            Self {
                calls: AtomicU32::new(0),
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _job: &JobRecord) -> Result<JobOutcome, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(JobOutcome::Completed))
        }
    }

    async fn queue(policy: QueuePolicy) -> (JobQueue, Arc<ManualClock>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (JobQueue::new("test", db, clock.clone(), policy), clock)
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_noop_until_finished() {
        let (q, clock) = queue(QueuePolicy::default()).await;
        let spec = JobSpec::new("job-1", &serde_json::json!({"n": 1})).unwrap();
        assert!(q.enqueue(spec.clone()).await.unwrap());
        assert!(!q.enqueue(spec.clone()).await.unwrap());

        let handler = Scripted::new(vec![]);
        let done = q.process_next_at(&handler, clock.now()).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // Finished jobs can be revived under the same id.
        assert!(q.enqueue(spec).await.unwrap());
        assert_eq!(q.get("job-1").await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn delayed_job_is_not_due_early() {
        let (q, clock) = queue(QueuePolicy::default()).await;
        let spec = JobSpec::new("later", &serde_json::json!({}))
            .unwrap()
            .delayed(Duration::from_secs(3600));
        q.enqueue(spec).await.unwrap();

        let handler = Scripted::new(vec![]);
        assert!(q.process_next_at(&handler, clock.now()).await.unwrap().is_none());
        let later = clock.now() + chrono::Duration::hours(1);
        assert!(q.process_next_at(&handler, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retryable_errors_back_off_then_fail() {
        let policy = QueuePolicy {
            max_attempts: 2,
            backoff_base: Duration::from_secs(1),
            ..QueuePolicy::default()
        };
        let (q, clock) = queue(policy).await;
        q.enqueue(JobSpec::new("flaky", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let handler = Scripted::new(vec![
            Err(JobError::retryable("db down")),
            Err(JobError::retryable("db still down")),
        ]);

        let first = q.process_next_at(&handler, clock.now()).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Pending);
        // Backoff keeps it invisible right now.
        assert!(q.process_next_at(&handler, clock.now()).await.unwrap().is_none());

        let later = clock.now() + chrono::Duration::seconds(5);
        let second = q.process_next_at(&handler, later).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.attempts, 2);

        let row = q.get("flaky").await.unwrap().unwrap();
        assert_eq!(row.last_error.as_deref(), Some("db still down"));
    }

    #[tokio::test]
    async fn fatal_error_fails_immediately() {
        let (q, clock) = queue(QueuePolicy::default()).await;
        q.enqueue(JobSpec::new("bad", &serde_json::json!({})).unwrap())
            .await
            .unwrap();
        let handler = Scripted::new(vec![Err(JobError::fatal("payload"))]);
        let done = q.process_next_at(&handler, clock.now()).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn deferral_does_not_consume_attempts() {
        let policy = QueuePolicy {
            max_attempts: 1,
            ..QueuePolicy::default()
        };
        let (q, clock) = queue(policy).await;
        q.enqueue(JobSpec::new("wait", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let resume_at = clock.now() + chrono::Duration::minutes(10);
        let handler = Scripted::new(vec![Ok(JobOutcome::Deferred(resume_at))]);
        let first = q.process_next_at(&handler, clock.now()).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        let row = q.get("wait").await.unwrap().unwrap();
        assert_eq!(row.attempts, 0);
        assert_eq!(row.run_at, resume_at);

        let second = q.process_next_at(&handler, resume_at).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stalled_jobs_are_recovered() {
        let policy = QueuePolicy {
            stall_timeout: Duration::from_secs(60),
            ..QueuePolicy::default()
        };
        let (q, clock) = queue(policy).await;
        q.enqueue(JobSpec::new("stuck", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let db = Arc::clone(&q.db);
        let now = clock.now();
        let claimed = db
            .claim_job("test", now, now + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(claimed.is_some());

        assert_eq!(q.recover_stalled().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(q.recover_stalled().await.unwrap(), 1);
        assert_eq!(q.get("stuck").await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn backoff_grows_exponentially() {
        let policy = QueuePolicy {
            backoff_base: Duration::from_millis(1000),
            ..QueuePolicy::default()
        };
        let (q, _) = queue(policy).await;
        let first = q.backoff(1);
        let third = q.backoff(3);
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1200));
        assert!(third >= Duration::from_millis(4000) && third <= Duration::from_millis(4800));
    }
}
