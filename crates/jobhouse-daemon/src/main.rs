use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jobhouse_core::JobhouseConfig;
use jobhouse_scheduler::{
    Clock, Engine, EngineConfig, JobState, JobStore, JobSummary, SqliteJobStore, SystemClock,
};
use serde::Serialize;
use tracing::{info, warn};

mod handlers;

#[derive(Parser)]
#[command(name = "jobhouse")]
#[command(about = "Persistent background job engine", long_about = None)]
struct Args {
    /// Config file (falls back to JOBHOUSE_CONFIG, then ~/.jobhouse/jobhouse.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until Ctrl-C (default)
    Run,
    /// Job counts per state
    Stats,
    /// List jobs, newest first
    List {
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show a single job
    Show { id: String },
    /// List recurring definitions
    Recurring,
    /// Move a failed job back to the queue
    Requeue { id: String },
    /// Delete a job in any state
    Delete { id: String },
    /// Materialize a recurring definition immediately
    Trigger { id: String },
    /// Remove a recurring definition
    RemoveRecurring { id: String },
    /// Submit a job, optionally for a later time
    Enqueue {
        job_type: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// RFC 3339 timestamp, e.g. 2026-01-01T09:00:00Z
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Add or replace a recurring definition
    Register {
        id: String,
        cron: String,
        job_type: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhouse_daemon=info,jobhouse_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // explicit --config > JOBHOUSE_CONFIG env > ~/.jobhouse/jobhouse.toml
    let config_path = args.config.or_else(|| std::env::var("JOBHOUSE_CONFIG").ok());
    let config = JobhouseConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobhouseConfig::default()
    });

    config.ensure_database_dir()?;
    let db_path = &config.database.path;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(db_path, clock.clone())?);

    let engine = Engine::new(
        store,
        handlers::builtin(),
        EngineConfig::from(&config),
        clock,
    );
    let admin = engine.admin();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(engine, &config).await?,
        Command::Stats => print_json(&admin.get_statistics()?)?,
        Command::List { state, limit } => print_json(&admin.list_jobs(state, limit)?)?,
        Command::Show { id } => print_json(&admin.get_job(&id)?)?,
        Command::Recurring => print_json(&admin.list_recurring()?)?,
        Command::Requeue { id } => print_json(&serde_json::json!({
            "id": id,
            "requeued": admin.requeue(&id)?,
        }))?,
        Command::Delete { id } => print_json(&serde_json::json!({
            "id": id,
            "deleted": admin.delete_job(&id)?,
        }))?,
        Command::Trigger { id } => {
            admin.trigger_recurring(&id)?;
            print_json(&serde_json::json!({ "id": id, "triggered": true }))?;
        }
        Command::RemoveRecurring { id } => {
            admin.remove_recurring(&id)?;
            print_json(&serde_json::json!({ "id": id, "removed": true }))?;
        }
        Command::Enqueue {
            job_type,
            payload,
            at,
        } => {
            let job = match at {
                Some(at) => engine.schedule(&job_type, &payload, at)?,
                None => engine.enqueue(&job_type, &payload)?,
            };
            print_json(&JobSummary::from(&job))?;
        }
        Command::Register {
            id,
            cron,
            job_type,
            payload,
        } => {
            let def = engine.register_recurring(&id, &cron, &job_type, &payload)?;
            print_json(&jobhouse_scheduler::RecurringSummary::from(&def))?;
        }
    }

    Ok(())
}

async fn run(engine: Engine, config: &JobhouseConfig) -> anyhow::Result<()> {
    info!(path = %config.database.path, "opened job store");

    // recurring definitions from the config file are upserted on every start
    for entry in &config.recurring {
        let payload = entry.payload.as_deref().unwrap_or("{}");
        if let Err(e) = engine.register_recurring(&entry.id, &entry.cron, &entry.job_type, payload)
        {
            warn!(recurring_id = %entry.id, "skipping recurring entry: {e}");
        }
    }

    let engine = Arc::new(engine);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    runner.await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
