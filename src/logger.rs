use std::future::Future;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the machine readable deploy events.
pub const EVENT_TARGET: &str = "flow_event";

/// Keeps the background file writers alive. Dropping it flushes and stops them.
#[derive(Default)]
pub struct LogGuards(Vec<WorkerGuard>);

/// Installs the global subscriber: stdout always, plus a daily rolling text
/// log and a JSON event log when `log_dir` is set.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<LogGuards> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log filter `{log_level}`"))?;
    let stdout_layer = fmt::layer().with_thread_names(true);

    let mut guards = Vec::new();
    let file_layers = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;

            let (txt_writer, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, "wireflow.log"));
            let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);

            let (json_writer, json_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
                Rotation::DAILY,
                dir,
                "wireflow-events.json",
            ));
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{EVENT_TARGET}=info")));

            guards.push(txt_guard);
            guards.push(json_guard);
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layers)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LogGuards(guards))
}

/// Runs a deploy future, logging its outcome and emitting one `flow_event`
/// line with the operation name and latency.
pub async fn instrument_deploy<Fut, T, E>(name: &str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = fut.await;
    let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

    match &result {
        Ok(_) => info!("deploy `{name}` succeeded in {elapsed:.1} ms"),
        Err(err) => error!(error = %err, "deploy `{name}` failed in {elapsed:.1} ms"),
    }
    tracing::event!(
        target: EVENT_TARGET,
        tracing::Level::INFO,
        operation = name,
        latency_ms = elapsed,
        status = if result.is_ok() { "success" } else { "error" },
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instrument_deploy_passes_result_through() {
        let ok: Result<u8, String> = instrument_deploy("ok", async { Ok(3) }).await;
        assert_eq!(ok, Ok(3));
        let err: Result<u8, String> = instrument_deploy("bad", async { Err("boom".to_string()) }).await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
