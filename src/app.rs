//! Service wiring shared by the binary and the integration tests.

use std::sync::Arc;

use secrecy::SecretString;

use crate::ai::{LlmProvider, ResponseGenerator};
use crate::channels::ChannelRouter;
use crate::clock::Clock;
use crate::http::AppState;
use crate::ingest::IngestDispatcher;
use crate::notify::{Gateway, NotificationBus};
use crate::pipeline::{BatchCoordinator, CoordinatorConfig, Outbox};
use crate::queue::{BATCH_QUEUE, JobQueue, QueuePolicy, SEQUENCE_QUEUE, WorkerPool};
use crate::resolver::Resolver;
use crate::sequence::SequenceScheduler;
use crate::store::Database;

/// Tunables for [`Services::build`].
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub coordinator: CoordinatorConfig,
    pub batch_queue: QueuePolicy,
    pub sequence_queue: QueuePolicy,
    pub api_token: Option<SecretString>,
}

/// Every long-lived service of the engine, constructed once.
#[derive(Clone)]
pub struct Services {
    pub db: Arc<dyn Database>,
    pub bus: Arc<NotificationBus>,
    pub gateway: Arc<Gateway>,
    pub resolver: Arc<Resolver>,
    pub batch_queue: Arc<JobQueue>,
    pub sequence_queue: Arc<JobQueue>,
    pub coordinator: Arc<BatchCoordinator>,
    pub scheduler: Arc<SequenceScheduler>,
    pub dispatcher: Arc<IngestDispatcher>,
    api_token: Option<Arc<SecretString>>,
}

impl Services {
    pub fn build(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        llm: Arc<dyn LlmProvider>,
        router: ChannelRouter,
        settings: EngineSettings,
    ) -> Self {
        let bus = Arc::new(NotificationBus::new());
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&db),
            Arc::clone(&bus),
            Arc::clone(&clock),
        ));
        let resolver = Arc::new(Resolver::new(Arc::clone(&db)));
        let generator = Arc::new(ResponseGenerator::new(llm));
        let outbox = Arc::new(Outbox::new(Arc::clone(&gateway), Arc::new(router)));

        let batch_queue = Arc::new(JobQueue::new(
            BATCH_QUEUE,
            Arc::clone(&db),
            Arc::clone(&clock),
            settings.batch_queue,
        ));
        let sequence_queue = Arc::new(JobQueue::new(
            SEQUENCE_QUEUE,
            Arc::clone(&db),
            clock,
            settings.sequence_queue,
        ));

        let debounce = settings.coordinator.debounce;
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&generator),
            Arc::clone(&outbox),
            settings.coordinator,
        ));
        let scheduler = Arc::new(SequenceScheduler::new(
            Arc::clone(&gateway),
            Arc::clone(&sequence_queue),
            generator,
            outbox,
        ));
        let dispatcher = Arc::new(IngestDispatcher::new(
            Arc::clone(&gateway),
            Arc::clone(&resolver),
            Arc::clone(&scheduler),
            Arc::clone(&batch_queue),
            debounce,
        ));

        Self {
            db,
            bus,
            gateway,
            resolver,
            batch_queue,
            sequence_queue,
            coordinator,
            scheduler,
            dispatcher,
            api_token: settings.api_token.map(Arc::new),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            gateway: Arc::clone(&self.gateway),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
            resolver: Arc::clone(&self.resolver),
            api_token: self.api_token.clone(),
        }
    }

    /// Start the batch and sequence worker pools.
    pub fn spawn_workers(&self) -> Vec<WorkerPool> {
        vec![
            WorkerPool::spawn(Arc::clone(&self.batch_queue), self.coordinator.clone()),
            WorkerPool::spawn(Arc::clone(&self.sequence_queue), self.scheduler.clone()),
        ]
    }
}
