use std::sync::Arc;

use chrono::SubsecRound;

use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    schedule::CronSchedule,
    store::{JobStore, Materialize},
    types::{Job, RecurringJobDefinition},
};

/// Catalog of cron-scheduled templates and the logic that turns firings into jobs.
pub struct RecurringEngine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl RecurringEngine {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Add or replace the definition `id`.
    ///
    /// The expression is validated first; nothing is stored if it is
    /// malformed. `next_execution` is computed from now when the id is new or
    /// its expression changed; re-registering an unchanged expression keeps
    /// any firing that is already due.
    pub fn register(
        &self,
        id: &str,
        cron_expression: &str,
        job_type: &str,
        payload: &str,
    ) -> Result<RecurringJobDefinition> {
        let schedule = CronSchedule::parse(cron_expression)?;
        let now = self.clock.now();
        let next_execution =
            schedule
                .next_after(now)
                .ok_or_else(|| SchedulerError::InvalidCronExpression {
                    expression: cron_expression.to_string(),
                    reason: "no future occurrence".to_string(),
                })?;

        let stored = self.store.upsert_recurring(&RecurringJobDefinition {
            id: id.to_string(),
            cron_expression: schedule.expression().to_string(),
            job_type: job_type.to_string(),
            payload: payload.to_string(),
            created_at: now,
            last_execution: None,
            next_execution,
        })?;
        info!(recurring_id = %id, cron = %stored.cron_expression, next = %stored.next_execution, "recurring job registered");
        Ok(stored)
    }

    /// Materialize every definition whose `next_execution` has passed.
    ///
    /// Each due definition fires once per call no matter how many firings were
    /// missed; the next one is computed from the current time rather than
    /// from the missed slot. The clock is read once per call. Returns the jobs
    /// created.
    pub fn fire_due(&self) -> Result<Vec<Job>> {
        let now = self.clock.now().trunc_subsecs(6);
        let mut fired = Vec::new();

        for def in self.store.due_recurring(now)? {
            let schedule = match CronSchedule::parse(&def.cron_expression) {
                Ok(s) => s,
                Err(e) => {
                    error!(recurring_id = %def.id, "stored definition unusable: {e}");
                    continue;
                }
            };
            let Some(next) = schedule.next_after(now) else {
                warn!(recurring_id = %def.id, "cron expression has no further occurrence");
                continue;
            };

            let how = Materialize::Due {
                expected: def.next_execution,
                next,
                now,
            };
            if let Some(job) = self.store.materialize_recurring(&def.id, how)? {
                info!(
                    recurring_id = %def.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    next = %next,
                    "recurring job fired"
                );
                fired.push(job);
            }
        }
        Ok(fired)
    }

    /// Materialize `id` right now without moving its schedule.
    ///
    /// Unknown ids are a silent no-op (`Ok(None)`).
    pub fn trigger(&self, id: &str) -> Result<Option<Job>> {
        let job = self.store.materialize_recurring(id, Materialize::Trigger)?;
        match &job {
            Some(job) => info!(recurring_id = %id, job_id = %job.id, "recurring job triggered"),
            None => info!(recurring_id = %id, "trigger ignored, unknown recurring job"),
        }
        Ok(job)
    }

    /// Delete the definition. Jobs it already materialized are untouched.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.store.remove_recurring(id)
    }

    pub fn list(&self) -> Result<Vec<RecurringJobDefinition>> {
        self.store.list_recurring()
    }
}
