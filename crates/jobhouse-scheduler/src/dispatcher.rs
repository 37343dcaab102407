use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    recurring::RecurringEngine,
    store::JobStore,
    types::{JobState, TransitionPatch},
    worker::WorkerPool,
};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs created from recurring definitions.
    pub materialized: usize,
    /// Jobs claimed and handed to a worker slot.
    pub dispatched: usize,
}

/// Control loop that claims ready jobs and hands them to the worker pool.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    recurring: Arc<RecurringEngine>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    /// Set while the store is unreachable so the outage is logged once.
    paused: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        recurring: Arc<RecurringEngine>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            recurring,
            clock,
            poll_interval,
            shutdown_grace,
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// One pass: fire due recurring definitions, then claim as many ready
    /// jobs as there are free slots.
    ///
    /// Ready jobs are taken oldest first (ties by id). A claim that loses a
    /// race against another dispatcher or an operator is skipped silently.
    pub fn tick(&self) -> Result<TickReport> {
        let materialized = self.recurring.fire_due()?.len();

        let free = self.pool.free_slots();
        if free == 0 {
            return Ok(TickReport {
                materialized,
                dispatched: 0,
            });
        }

        let mut dispatched = 0;
        for job in self.store.ready_jobs(free)? {
            let Some(permit) = self.pool.try_reserve() else {
                break;
            };
            match self.store.transition(
                &job.id,
                &[JobState::Enqueued, JobState::Scheduled],
                JobState::Processing,
                TransitionPatch::claim(self.clock.now()),
            ) {
                Ok(claimed) => {
                    info!(job_id = %claimed.id, job_type = %claimed.job_type, attempt = claimed.retry_count, "job claimed");
                    self.pool.spawn(claimed, permit);
                    dispatched += 1;
                }
                Err(e @ (SchedulerError::NotFound { .. } | SchedulerError::InvalidTransition { .. })) => {
                    debug!(job_id = %job.id, "claim skipped: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(TickReport {
            materialized,
            dispatched,
        })
    }

    /// Put jobs stranded in `Processing` by a previous process back in the queue.
    ///
    /// Only safe when no other dispatcher shares the store, since their
    /// in-flight jobs look the same.
    pub fn recover_orphaned(&self) -> Result<usize> {
        let mut recovered = 0;
        for job in self.store.list(Some(JobState::Processing), usize::MAX)? {
            match self.store.transition(
                &job.id,
                &[JobState::Processing],
                JobState::Enqueued,
                TransitionPatch::default(),
            ) {
                Ok(_) => recovered += 1,
                Err(SchedulerError::NotFound { .. } | SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "orphaned jobs re-enqueued on startup");
        }
        Ok(recovered)
    }

    /// Main event loop. Ticks every `poll_interval` until `shutdown` broadcasts
    /// `true`, then drains the worker pool.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.pool.size(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "dispatcher started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick_logged(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    fn tick_logged(&self) {
        match self.tick() {
            Ok(report) => {
                if self.paused.swap(false, Ordering::SeqCst) {
                    info!("store reachable again, dispatcher resumed");
                }
                if report != TickReport::default() {
                    debug!(
                        materialized = report.materialized,
                        dispatched = report.dispatched,
                        "tick"
                    );
                }
            }
            Err(e @ SchedulerError::StoreUnavailable(_)) => {
                if !self.paused.swap(true, Ordering::SeqCst) {
                    error!("store unavailable, dispatcher paused: {e}");
                }
            }
            Err(e) => error!("dispatcher tick error: {e}"),
        }
    }

    async fn drain(&self) {
        if tokio::time::timeout(self.shutdown_grace, self.pool.wait_idle())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "jobs still running after grace period, cancelling"
            );
            self.pool.cancel_all();
            self.pool.wait_idle().await;
        }
        info!("dispatcher stopped");
    }
}
