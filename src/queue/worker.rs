//! Worker pool: `concurrency` tokio tasks pulling from one `JobQueue`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::queue::job::{JobHandler, JobQueue};

pub struct WorkerPool {
    queue: String,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn the queue's configured number of workers plus a stall-recovery ticker.
    pub fn spawn(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let concurrency = queue.policy().concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency + 1);

        for worker_id in 0..concurrency {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&handler),
                rx.clone(),
            )));
        }
        handles.push(spawn_stall_ticker(Arc::clone(&queue), rx));

        info!(queue = queue.name(), concurrency, "Worker pool started");
        Self {
            queue: queue.name().to_string(),
            handles,
            shutdown,
        }
    }

    /// Signal every worker to stop after its current job and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.handles).await;
        info!(queue = %self.queue, "Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let wake = queue.wake_handle();
    let poll = queue.policy().poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.process_next(handler.as_ref()).await {
            // Drain back-to-back while jobs are due.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(queue = queue.name(), worker_id, error = %e, "Queue poll failed"),
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn spawn_stall_ticker(queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (queue.policy().stall_timeout / 2).max(queue.policy().poll_interval);
        let mut ticker = tokio::time::interval(period);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = queue.recover_stalled().await {
                        error!(queue = queue.name(), error = %e, "Stall recovery failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::SystemClock;
    use crate::error::JobError;
    use crate::queue::job::{JobOutcome, JobRecord, JobSpec, QueuePolicy};
    use crate::store::{Database, LibSqlBackend};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &JobRecord) -> Result<JobOutcome, JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutcome::Completed)
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let policy = QueuePolicy {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..QueuePolicy::default()
        };
        let queue = Arc::new(JobQueue::new("pool", db, Arc::new(SystemClock), policy));
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let pool = WorkerPool::spawn(Arc::clone(&queue), handler.clone());

        for i in 0..5 {
            queue
                .enqueue(JobSpec::new(format!("job-{i}"), &serde_json::json!({ "i": i })).unwrap())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.0.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs processed");

        pool.shutdown().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 5);
    }
}
