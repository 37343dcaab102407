//! `jobhouse-core` — configuration shared by the scheduler engine and the daemon.

pub mod config;
pub mod error;

pub use config::JobhouseConfig;
pub use error::{CoreError, Result};
