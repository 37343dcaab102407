use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run as soon as a worker slot is free.
    Enqueued,
    /// Waiting for `scheduled_for` to arrive (delayed submission or retry backoff).
    Scheduled,
    /// Claimed by the dispatcher and running in a worker slot.
    Processing,
    /// Handler returned successfully. Terminal.
    Succeeded,
    /// Retries exhausted (or no handler). Terminal until an administrative requeue.
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Enqueued,
        JobState::Scheduled,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Scheduled => "scheduled",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enqueued" => Ok(JobState::Enqueued),
            "scheduled" => Ok(JobState::Scheduled),
            "processing" => Ok(JobState::Processing),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 string — time-ordered primary key.
    pub id: String,
    /// Name of the handler to invoke.
    pub job_type: String,
    /// Opaque JSON payload forwarded to the handler.
    pub payload: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Set when the dispatcher claims the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on a terminal outcome.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retry attempts already consumed.
    pub retry_count: u32,
    /// Last failure detail; only present while `state == Failed`.
    pub exception: Option<String>,
    /// Activation time; only present while `state == Scheduled`.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Recurring definition that materialized this job, if any.
    pub recurring_id: Option<String>,
}

impl Job {
    pub fn new_enqueued(
        id: String,
        job_type: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type: job_type.to_string(),
            payload: payload.to_string(),
            state: JobState::Enqueued,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            exception: None,
            scheduled_for: None,
            recurring_id: None,
        }
    }

    /// Wall-clock run time of the last execution, when it has completed.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Produce the record as it looks after moving to `to`.
    ///
    /// Fields that belong to other states are cleared so a job never carries
    /// stale data: `exception` only lives on `Failed`, `scheduled_for` only on
    /// `Scheduled`, and re-entering the queue forgets the previous run.
    pub fn apply(&self, to: JobState, patch: &TransitionPatch) -> Job {
        let mut next = self.clone();
        next.state = to;
        if let Some(count) = patch.retry_count {
            next.retry_count = count;
        }
        match to {
            JobState::Enqueued => {
                next.started_at = None;
                next.completed_at = None;
                next.exception = None;
                next.scheduled_for = None;
            }
            JobState::Scheduled => {
                next.completed_at = None;
                next.exception = None;
                next.scheduled_for = patch.scheduled_for.or(self.scheduled_for);
            }
            JobState::Processing => {
                next.started_at = patch.started_at.or(self.started_at);
                next.completed_at = None;
                next.exception = None;
                next.scheduled_for = None;
            }
            JobState::Succeeded => {
                next.completed_at = patch.completed_at.or(self.completed_at);
                next.exception = None;
                next.scheduled_for = None;
            }
            JobState::Failed => {
                next.completed_at = patch.completed_at.or(self.completed_at);
                next.exception = patch.exception.clone().or_else(|| self.exception.clone());
                next.scheduled_for = None;
            }
        }
        next
    }
}

/// Field values carried by a state transition.
///
/// Only the fields meaningful for the target state are read; see [`Job::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub exception: Option<String>,
}

impl TransitionPatch {
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn succeed(now: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn retry(retry_count: u32, at: DateTime<Utc>) -> Self {
        Self {
            retry_count: Some(retry_count),
            scheduled_for: Some(at),
            ..Default::default()
        }
    }

    pub fn fail(now: DateTime<Utc>, exception: impl Into<String>) -> Self {
        Self {
            completed_at: Some(now),
            exception: Some(exception.into()),
            ..Default::default()
        }
    }

    pub fn requeue() -> Self {
        Self {
            retry_count: Some(0),
            ..Default::default()
        }
    }
}

/// A cron-driven template that materializes new jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJobDefinition {
    /// Caller-chosen identifier, e.g. `"nightly-report"`.
    pub id: String,
    pub cron_expression: String,
    pub job_type: String,
    /// Payload copied into every materialized job.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    /// Always strictly after the last evaluation time.
    pub next_execution: DateTime<Utc>,
}

/// Point-in-time counts derived from the store. Never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub enqueued: u64,
    pub scheduled: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub recurring: u64,
    /// Creation time of the oldest job still in the store.
    pub oldest_job: Option<DateTime<Utc>>,
    /// Most recent terminal outcome.
    pub last_completion: Option<DateTime<Utc>>,
}

impl Statistics {
    pub fn total(&self) -> u64 {
        self.enqueued + self.scheduled + self.processing + self.succeeded + self.failed
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Enqueued => self.enqueued,
            JobState::Scheduled => self.scheduled,
            JobState::Processing => self.processing,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
        }
    }

    pub(crate) fn set_count(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Enqueued => self.enqueued = n,
            JobState::Scheduled => self.scheduled = n,
            JobState::Processing => self.processing = n,
            JobState::Succeeded => self.succeeded = n,
            JobState::Failed => self.failed = n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job() -> Job {
        Job::new_enqueued("j1".into(), "email", "{}", t(0))
    }

    #[test]
    fn state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("Failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("deleted".parse::<JobState>().is_err());
    }

    #[test]
    fn claim_sets_started_and_clears_schedule() {
        let mut scheduled = job();
        scheduled.state = JobState::Scheduled;
        scheduled.scheduled_for = Some(t(30));

        let claimed = scheduled.apply(JobState::Processing, &TransitionPatch::claim(t(31)));
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.started_at, Some(t(31)));
        assert_eq!(claimed.scheduled_for, None);
    }

    #[test]
    fn failure_records_exception_and_duration() {
        let running = job().apply(JobState::Processing, &TransitionPatch::claim(t(5)));
        let failed = running.apply(JobState::Failed, &TransitionPatch::fail(t(8), "boom"));
        assert_eq!(failed.exception.as_deref(), Some("boom"));
        assert_eq!(failed.duration(), Some(Duration::seconds(3)));
    }

    #[test]
    fn requeue_resets_run_fields() {
        let mut failed = job().apply(JobState::Processing, &TransitionPatch::claim(t(5)));
        failed.retry_count = 3;
        let failed = failed.apply(JobState::Failed, &TransitionPatch::fail(t(8), "boom"));

        let requeued = failed.apply(JobState::Enqueued, &TransitionPatch::requeue());
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.exception, None);
        assert_eq!(requeued.started_at, None);
        assert_eq!(requeued.completed_at, None);
        assert_eq!(requeued.duration(), None);
        assert_eq!(requeued.created_at, t(0));
    }

    #[test]
    fn retry_moves_to_scheduled_without_exception() {
        let running = job().apply(JobState::Processing, &TransitionPatch::claim(t(5)));
        let retrying = running.apply(JobState::Scheduled, &TransitionPatch::retry(1, t(20)));
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(retrying.scheduled_for, Some(t(20)));
        assert_eq!(retrying.exception, None);
        assert_eq!(retrying.completed_at, None);
    }

    #[test]
    fn statistics_total_sums_states() {
        let mut stats = Statistics::default();
        stats.set_count(JobState::Enqueued, 2);
        stats.set_count(JobState::Failed, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.count(JobState::Failed), 1);
    }
}
