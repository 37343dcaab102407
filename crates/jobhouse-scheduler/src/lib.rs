//! `jobhouse-scheduler` — background job engine with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted through a [`store::JobStore`]. The [`dispatcher::Dispatcher`]
//! polls the store every tick, materializes due recurring definitions, and
//! claims ready jobs into a bounded [`worker::WorkerPool`]. Outcomes are
//! written back through the store; failures go through the
//! [`retry::RetryPolicy`] before the job is failed terminally.
//!
//! # State machine
//!
//! | From                 | Event                          | To           |
//! |----------------------|--------------------------------|--------------|
//! | `enqueued`/`scheduled` | claimed by dispatcher        | `processing` |
//! | `processing`         | handler succeeded              | `succeeded`  |
//! | `processing`         | failed, retries left           | `scheduled`  |
//! | `processing`         | failed, retries exhausted      | `failed`     |
//! | `failed`             | administrative requeue         | `enqueued`   |
//! | any                  | administrative delete          | removed      |

pub mod admin;
pub mod clock;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod recurring;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod types;
pub mod worker;

pub use admin::{JobAdmin, JobSummary, RecurringSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineConfig};
pub use error::{Result, SchedulerError};
pub use store::{JobStore, SqliteJobStore};
pub use types::{Job, JobState, RecurringJobDefinition, Statistics};
pub use worker::{HandlerRegistry, JobContext, JobHandler};
