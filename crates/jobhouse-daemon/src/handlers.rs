use std::time::Duration;

use jobhouse_scheduler::{HandlerRegistry, JobContext};
use serde::Deserialize;
use tracing::info;

/// Handlers available to every daemon instance.
pub fn builtin() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", noop);
    registry.register_fn("log", log);
    registry.register_fn("fail", fail);
    registry.register_fn("sleep", sleep);
    registry
}

async fn noop(_ctx: JobContext) -> anyhow::Result<()> {
    Ok(())
}

async fn log(ctx: JobContext) -> anyhow::Result<()> {
    info!(job_id = %ctx.job_id, attempt = ctx.retry_count, payload = %ctx.payload, "log job");
    Ok(())
}

async fn fail(ctx: JobContext) -> anyhow::Result<()> {
    anyhow::bail!("job {} failed on request", ctx.job_id)
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    #[serde(default = "default_sleep_secs")]
    secs: u64,
}

fn default_sleep_secs() -> u64 {
    1
}

async fn sleep(ctx: JobContext) -> anyhow::Result<()> {
    let args: SleepArgs = ctx.payload_as()?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.secs)) => Ok(()),
        _ = ctx.cancel.cancelled() => anyhow::bail!("sleep of {}s cancelled", args.secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx(payload: &str) -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            job_type: "sleep".to_string(),
            payload: payload.to_string(),
            retry_count: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn builtin_types_are_registered() {
        assert_eq!(builtin().job_types(), vec!["fail", "log", "noop", "sleep"]);
    }

    #[tokio::test]
    async fn sleep_stops_when_cancelled() {
        let ctx = ctx(r#"{"secs": 3600}"#);
        ctx.cancel.cancel();
        let err = sleep(ctx).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn sleep_rejects_malformed_payload() {
        assert!(sleep(ctx("not json")).await.is_err());
    }

    #[tokio::test]
    async fn fail_always_errors() {
        assert!(fail(ctx("{}")).await.is_err());
        assert!(noop(ctx("{}")).await.is_ok());
    }
}
