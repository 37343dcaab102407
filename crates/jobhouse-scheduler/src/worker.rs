use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::SchedulerError,
    retry::{RetryDecision, RetryPolicy},
    store::JobStore,
    types::{Job, JobState, TransitionPatch},
};

/// Recorded as the exception of a job whose type has no registered handler.
pub const HANDLER_NOT_REGISTERED: &str = "handler not registered";

/// Everything a handler gets to know about the execution it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: String,
    /// Raw JSON payload as submitted.
    pub payload: String,
    /// Retries already consumed before this attempt.
    pub retry_count: u32,
    /// Fired when the engine abandons this execution (timeout or shutdown).
    /// Honouring it is optional; the slot is reclaimed either way.
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Deserialize the payload into a handler-specific type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }
}

/// Executable unit registered for a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter that lets an async closure or `async fn` act as a [`JobHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Mapping from job type name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        debug!(%job_type, "handler registered");
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Register an async closure or `async fn` for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Result of one execution attempt, before it is written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Handler returned an error, panicked, or timed out. Eligible for retry.
    Faulted(String),
    /// No handler for the job type. Fails terminally without retrying.
    Unhandled,
}

/// Bounded set of execution slots.
///
/// A slot is a semaphore permit. The dispatcher reserves one with
/// [`WorkerPool::try_reserve`] before claiming a job, so a claimed job always
/// has somewhere to run.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    timeout: Duration,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        timeout: Duration,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn JobStore>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            timeout,
            registry,
            store,
            retry,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Run `job` (already claimed into `Processing`) on the reserved slot.
    ///
    /// Returns immediately; the permit is released when the execution and its
    /// store write-back have finished.
    pub fn spawn(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = pool.execute(&job).await;
            pool.finish(&job, outcome);
            drop(permit);
        });
    }

    /// Resolves once every slot is free again.
    pub async fn wait_idle(&self) {
        // `acquire_many` only returns Err once the semaphore is closed, which never happens.
        if let Ok(all) = self.slots.acquire_many(self.size as u32).await {
            drop(all);
        }
    }

    /// Signal every running handler to stop. Advisory only.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    async fn execute(&self, job: &Job) -> Outcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
            return Outcome::Unhandled;
        };

        let cancel = self.shutdown.child_token();
        let ctx = JobContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
            cancel: cancel.clone(),
        };

        // The handler gets its own task so a handler that never yields cannot
        // hold this slot past the timeout.
        let mut task = tokio::spawn(async move { handler.run(ctx).await });
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(job_id = %job.id, elapsed_ms, "handler finished");
                Outcome::Succeeded
            }
            Ok(Ok(Err(e))) => Outcome::Faulted(format!("{e:#}")),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Outcome::Faulted(format!("handler panicked: {}", panic_message(join_err)))
            }
            Ok(Err(join_err)) => Outcome::Faulted(format!("handler aborted: {join_err}")),
            Err(_) => {
                cancel.cancel();
                task.abort();
                warn!(
                    job_id = %job.id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "handler timed out; slot reclaimed"
                );
                Outcome::Faulted(format!(
                    "handler timed out after {:?}",
                    self.timeout
                ))
            }
        }
    }

    /// Write the outcome back through the store, consulting the retry policy
    /// on failure. Losing the job in the meantime (deleted by an operator) is
    /// logged, not propagated.
    fn finish(&self, job: &Job, outcome: Outcome) {
        let now = self.clock.now();
        let from = [JobState::Processing];
        let result = match &outcome {
            Outcome::Succeeded => self
                .store
                .transition(&job.id, &from, JobState::Succeeded, TransitionPatch::succeed(now))
                .map(|done| {
                    let duration_ms = done.duration().map(|d| d.num_milliseconds()).unwrap_or(0);
                    info!(job_id = %job.id, job_type = %job.job_type, duration_ms, "job succeeded");
                }),
            Outcome::Unhandled => self
                .store
                .transition(
                    &job.id,
                    &from,
                    JobState::Failed,
                    TransitionPatch::fail(now, HANDLER_NOT_REGISTERED),
                )
                .map(|_| error!(job_id = %job.id, job_type = %job.job_type, "job failed: {HANDLER_NOT_REGISTERED}")),
            Outcome::Faulted(detail) => self.fail(job, detail, now),
        };

        match result {
            Ok(()) => {}
            Err(e @ (SchedulerError::NotFound { .. } | SchedulerError::InvalidTransition { .. })) => {
                warn!(job_id = %job.id, "outcome discarded, job changed while running: {e}");
            }
            Err(e) => error!(job_id = %job.id, "failed to record job outcome: {e}"),
        }
    }

    fn fail(&self, job: &Job, detail: &str, now: chrono::DateTime<chrono::Utc>) -> crate::Result<()> {
        let fault = SchedulerError::HandlerFault(detail.to_string());
        match self.retry.decide(job.retry_count, now) {
            RetryDecision::Retry { retry_count, at } => {
                self.store.transition(
                    &job.id,
                    &[JobState::Processing],
                    JobState::Scheduled,
                    TransitionPatch::retry(retry_count, at),
                )?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = retry_count,
                    retry_at = %at,
                    "{fault}; retry scheduled"
                );
            }
            RetryDecision::Exhausted => {
                self.store.transition(
                    &job.id,
                    &[JobState::Processing],
                    JobState::Failed,
                    TransitionPatch::fail(now, detail),
                )?;
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retries = job.retry_count,
                    "{fault}; retries exhausted"
                );
            }
        }
        Ok(())
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::SqliteJobStore;

    fn pool_with(registry: HandlerRegistry, max_retries: u32, timeout: Duration) -> (Arc<WorkerPool>, Arc<dyn JobStore>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory(clock.clone()).unwrap());
        let retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        let pool = WorkerPool::new(2, timeout, Arc::new(registry), store.clone(), retry, clock);
        (Arc::new(pool), store)
    }

    fn claim(store: &Arc<dyn JobStore>, job_type: &str) -> Job {
        let job = store.enqueue(job_type, "{}").unwrap();
        store
            .transition(&job.id, &[JobState::Enqueued], JobState::Processing, TransitionPatch::claim(chrono::Utc::now()))
            .unwrap()
    }

    async fn run_one(pool: &Arc<WorkerPool>, job: Job) {
        let permit = pool.try_reserve().unwrap();
        pool.spawn(job, permit);
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn success_marks_job_succeeded() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ok", |_ctx: JobContext| async { Ok(()) });
        let (pool, store) = pool_with(registry, 3, Duration::from_secs(5));

        let job = claim(&store, "ok");
        run_one(&pool, job.clone()).await;

        let done = store.get(&job.id).unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.duration().unwrap() >= chrono::Duration::zero());
        assert_eq!(pool.free_slots(), 2);
    }

    #[tokio::test]
    async fn missing_handler_fails_terminally() {
        let (pool, store) = pool_with(HandlerRegistry::new(), 3, Duration::from_secs(5));
        let job = claim(&store, "unknown");
        run_one(&pool, job.clone()).await;

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.exception.as_deref(), Some(HANDLER_NOT_REGISTERED));
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn error_schedules_retry_with_backoff() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", |_ctx: JobContext| async { anyhow::bail!("connection refused") });
        let (pool, store) = pool_with(registry, 3, Duration::from_secs(5));

        let job = claim(&store, "flaky");
        run_one(&pool, job.clone()).await;

        let retried = store.get(&job.id).unwrap();
        assert_eq!(retried.state, JobState::Scheduled);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.scheduled_for.unwrap() > job.started_at.unwrap());
        assert_eq!(retried.exception, None);
    }

    #[tokio::test]
    async fn panic_is_a_failure() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |_ctx: JobContext| async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        let (pool, store) = pool_with(registry, 0, Duration::from_secs(5));

        let job = claim(&store, "boom");
        run_one(&pool, job.clone()).await;

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.exception.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn timeout_reclaims_slot_and_signals_cancel() {
        let token_slot = Arc::new(std::sync::Mutex::new(None::<CancellationToken>));
        let seen = token_slot.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("hang", move |ctx: JobContext| {
            *seen.lock().unwrap() = Some(ctx.cancel.clone());
            async move {
                // Ignores the cancel signal; the slot must be reclaimed anyway.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        });
        let (pool, store) = pool_with(registry, 0, Duration::from_millis(50));

        let job = claim(&store, "hang");
        tokio::time::timeout(Duration::from_secs(5), run_one(&pool, job.clone()))
            .await
            .expect("slot was not reclaimed");

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.exception.unwrap().contains("timed out"));
        assert_eq!(pool.free_slots(), 2);

        let token = token_slot.lock().unwrap().clone().expect("handler never ran");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn deleted_while_running_is_not_an_error() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ok", |_ctx: JobContext| async { Ok(()) });
        let (pool, store) = pool_with(registry, 3, Duration::from_secs(5));

        let job = claim(&store, "ok");
        assert!(store.delete(&job.id).unwrap());
        run_one(&pool, job.clone()).await;
        assert!(store.get(&job.id).is_err());
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn payload_deserializes() {
        #[derive(serde::Deserialize)]
        struct Email {
            to: String,
        }
        let ctx = JobContext {
            job_id: "j".into(),
            job_type: "email".into(),
            payload: r#"{"to":"ops@example.com"}"#.into(),
            retry_count: 0,
            cancel: CancellationToken::new(),
        };
        assert_eq!(ctx.payload_as::<Email>().unwrap().to, "ops@example.com");
    }
}
