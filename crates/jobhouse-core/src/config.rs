use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000; // dispatcher tick cadence
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300; // slot is reclaimed after this
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30; // drain window before handlers are cancelled
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_SECS: u64 = 15;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 3_600; // backoff cap: one hour

/// Top-level config (jobhouse.toml + JOBHOUSE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobhouseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Recurring definitions registered (upserted) every time the daemon starts.
    #[serde(default)]
    pub recurring: Vec<RecurringEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatcher and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Number of concurrent execution slots.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-execution timeout. A handler running longer is abandoned.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// How long shutdown waits for running jobs before signalling cancellation.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Move jobs left in `processing` by a crashed process back to `enqueued`.
    #[serde(default = "bool_true")]
    pub recover_on_startup: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            recover_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

/// A recurring job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurringEntry {
    pub id: String,
    /// Five-field (`* * * * *`) or seconds-first cron expression.
    pub cron: String,
    pub job_type: String,
    /// JSON payload handed to every materialized instance.
    #[serde(default)]
    pub payload: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_secs() -> u64 {
    DEFAULT_BASE_DELAY_SECS
}
fn default_max_delay_secs() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhouse/jobhouse.db", home)
}

impl JobhouseConfig {
    /// Load config from a TOML file with JOBHOUSE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobhouse/jobhouse.toml
    ///
    /// Nested keys use a double underscore, e.g. `JOBHOUSE_ENGINE__WORKERS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        if !std::path::Path::new(&path).exists() {
            debug!(path = %path, "config file not found, using defaults and env");
        }

        let config: JobhouseConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBHOUSE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        debug!(path = %path, workers = config.engine.workers, "config loaded");
        Ok(config)
    }

    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_database_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.database.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.engine.workers == 0 {
            return Err(crate::error::CoreError::Config(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(crate::error::CoreError::Config(
                "engine.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.engine.job_timeout_secs == 0 {
            return Err(crate::error::CoreError::Config(
                "engine.job_timeout_secs must be positive".to_string(),
            ));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(crate::error::CoreError::Config(format!(
                "retry.base_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                self.retry.base_delay_secs, self.retry.max_delay_secs
            )));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhouse/jobhouse.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = JobhouseConfig::load(Some("/nonexistent/jobhouse.toml")).unwrap();
        assert_eq!(config.engine.workers, DEFAULT_WORKERS);
        assert_eq!(config.retry.max_retries, DEFAULT_MAX_RETRIES);
        assert!(config.recurring.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine]
workers = 2
job_timeout_secs = 5

[retry]
max_retries = 1

[[recurring]]
id = "nightly-report"
cron = "0 3 * * *"
job_type = "report"
"#
        )
        .unwrap();

        let config = JobhouseConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.job_timeout_secs, 5);
        assert_eq!(config.engine.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_secs, DEFAULT_BASE_DELAY_SECS);
        assert_eq!(config.recurring.len(), 1);
        assert_eq!(config.recurring[0].job_type, "report");
        assert_eq!(config.recurring[0].payload, None);
    }

    #[test]
    fn database_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobhouseConfig::default();
        config.database.path = dir
            .path()
            .join("nested/state/jobhouse.db")
            .to_string_lossy()
            .into_owned();

        config.ensure_database_dir().unwrap();
        assert!(dir.path().join("nested/state").is_dir());
    }

    #[test]
    fn database_dir_blocked_by_file_is_io_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut config = JobhouseConfig::default();
        config.database.path = file
            .path()
            .join("jobhouse.db")
            .to_string_lossy()
            .into_owned();

        let err = config.ensure_database_dir().unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = JobhouseConfig::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn base_delay_above_cap_rejected() {
        let mut config = JobhouseConfig::default();
        config.retry.base_delay_secs = 10;
        config.retry.max_delay_secs = 5;
        assert!(config.validate().is_err());
    }
}
