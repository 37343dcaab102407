use thiserror::Error;

use crate::types::JobState;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No job or recurring definition with the given ID exists in the store.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// The job was not in one of the expected states (lost claim race, or an
    /// administrative operation against the wrong state).
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    /// The cron expression could not be parsed or never fires.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// A handler returned an error, panicked, or timed out.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// A persisted row could not be decoded.
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

impl SchedulerError {
    /// Short error code string for callers that map errors onto responses.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::InvalidCronExpression { .. } => "INVALID_CRON_EXPRESSION",
            SchedulerError::HandlerFault(_) => "HANDLER_FAULT",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
