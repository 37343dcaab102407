//! Management surface for operators: statistics, enumeration, requeue,
//! delete, and recurring-job control.
//!
//! Every operation reads from or transitions through the [`JobStore`]; nothing
//! here mutates records directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, SchedulerError},
    recurring::RecurringEngine,
    store::JobStore,
    types::{Job, JobState, RecurringJobDefinition, Statistics, TransitionPatch},
};

/// Job as shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    /// Symbolic state name, e.g. `"failed"`.
    pub state: String,
    pub job_type: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// `completed_at - started_at`, when both are present.
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub recurring_id: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state.to_string(),
            job_type: job.job_type.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            scheduled_for: job.scheduled_for,
            duration_ms: job.duration().map(|d| d.num_milliseconds()),
            error: job.exception.clone(),
            retry_count: job.retry_count,
            recurring_id: job.recurring_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSummary {
    pub id: String,
    pub cron: String,
    pub job_type: String,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
}

impl From<&RecurringJobDefinition> for RecurringSummary {
    fn from(def: &RecurringJobDefinition) -> Self {
        Self {
            id: def.id.clone(),
            cron: def.cron_expression.clone(),
            job_type: def.job_type.clone(),
            created_at: def.created_at,
            last_execution: def.last_execution,
            next_execution: def.next_execution,
        }
    }
}

/// Cheap-to-clone handle for management operations while the dispatcher runs.
#[derive(Clone)]
pub struct JobAdmin {
    store: Arc<dyn JobStore>,
    recurring: Arc<RecurringEngine>,
}

impl JobAdmin {
    pub fn new(store: Arc<dyn JobStore>, recurring: Arc<RecurringEngine>) -> Self {
        Self { store, recurring }
    }

    pub fn get_statistics(&self) -> Result<Statistics> {
        self.store.statistics()
    }

    pub fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<JobSummary>> {
        Ok(self
            .store
            .list(state, limit)?
            .iter()
            .map(JobSummary::from)
            .collect())
    }

    /// Fails with `NotFound` for an unknown id.
    pub fn get_job(&self, id: &str) -> Result<JobSummary> {
        self.store.get(id).map(|job| JobSummary::from(&job))
    }

    pub fn list_recurring(&self) -> Result<Vec<RecurringSummary>> {
        Ok(self
            .recurring
            .list()?
            .iter()
            .map(RecurringSummary::from)
            .collect())
    }

    /// Move a terminally failed job back to `Enqueued` with its retry budget reset.
    ///
    /// Returns `false` when the job does not exist or is not `Failed`.
    pub fn requeue(&self, id: &str) -> Result<bool> {
        match self.store.transition(
            id,
            &[JobState::Failed],
            JobState::Enqueued,
            TransitionPatch::requeue(),
        ) {
            Ok(_) => {
                info!(job_id = %id, "job requeued");
                Ok(true)
            }
            Err(SchedulerError::NotFound { .. }) => Ok(false),
            Err(SchedulerError::InvalidTransition { from, .. }) => {
                info!(job_id = %id, state = %from, "requeue rejected, job is not failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns `false` when the job does not exist.
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        self.store.delete(id)
    }

    /// Unknown ids are ignored.
    pub fn trigger_recurring(&self, id: &str) -> Result<()> {
        self.recurring.trigger(id).map(|_| ())
    }

    /// Unknown ids are ignored.
    pub fn remove_recurring(&self, id: &str) -> Result<()> {
        self.recurring.remove(id).map(|_| ())
    }
}
