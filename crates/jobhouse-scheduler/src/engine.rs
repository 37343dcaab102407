use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobhouse_core::JobhouseConfig;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    admin::JobAdmin,
    clock::Clock,
    dispatcher::{Dispatcher, TickReport},
    error::Result,
    recurring::RecurringEngine,
    retry::RetryPolicy,
    store::JobStore,
    types::{Job, RecurringJobDefinition},
    worker::{HandlerRegistry, WorkerPool},
};

/// Runtime settings for [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    pub recover_on_startup: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&JobhouseConfig::default())
    }
}

impl From<&JobhouseConfig> for EngineConfig {
    fn from(config: &JobhouseConfig) -> Self {
        Self {
            workers: config.engine.workers.max(1),
            poll_interval: Duration::from_millis(config.engine.poll_interval_ms),
            job_timeout: Duration::from_secs(config.engine.job_timeout_secs),
            shutdown_grace: Duration::from_secs(config.engine.shutdown_grace_secs),
            recover_on_startup: config.engine.recover_on_startup,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// The assembled engine: store, worker pool, recurring catalog, and dispatcher.
///
/// Submissions (`enqueue`, `schedule`, `register_recurring`) can be made from
/// any thread while [`Engine::run`] drives the dispatcher loop.
pub struct Engine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    pool: Arc<WorkerPool>,
    recurring: Arc<RecurringEngine>,
    dispatcher: Dispatcher,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(
            config.workers,
            config.job_timeout,
            Arc::new(registry),
            store.clone(),
            config.retry,
            clock.clone(),
        ));
        let recurring = Arc::new(RecurringEngine::new(store.clone(), clock.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            pool.clone(),
            recurring.clone(),
            clock.clone(),
            config.poll_interval,
            config.shutdown_grace,
        );
        Self {
            store,
            clock,
            pool,
            recurring,
            dispatcher,
            config,
        }
    }

    pub fn enqueue(&self, job_type: &str, payload: &str) -> Result<Job> {
        self.store.enqueue(job_type, payload)
    }

    pub fn schedule(&self, job_type: &str, payload: &str, at: DateTime<Utc>) -> Result<Job> {
        self.store.schedule(job_type, payload, at)
    }

    /// Schedule relative to the engine's clock.
    pub fn schedule_in(&self, job_type: &str, payload: &str, delay: chrono::Duration) -> Result<Job> {
        self.store.schedule(job_type, payload, self.clock.now() + delay)
    }

    pub fn register_recurring(
        &self,
        id: &str,
        cron_expression: &str,
        job_type: &str,
        payload: &str,
    ) -> Result<RecurringJobDefinition> {
        self.recurring.register(id, cron_expression, job_type, payload)
    }

    pub fn admin(&self) -> JobAdmin {
        JobAdmin::new(self.store.clone(), self.recurring.clone())
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn free_slots(&self) -> usize {
        self.pool.free_slots()
    }

    /// Run a single dispatcher pass. Useful for driving the engine by hand.
    pub fn tick(&self) -> Result<TickReport> {
        self.dispatcher.tick()
    }

    /// Resolves once no job is executing.
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Run until `shutdown` broadcasts `true`, then drain running jobs.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("job engine started");
        if self.config.recover_on_startup {
            if let Err(e) = self.dispatcher.recover_orphaned() {
                error!("orphan recovery failed: {e}");
            }
        }
        self.dispatcher.run(shutdown).await;
        info!("job engine stopped");
    }
}
