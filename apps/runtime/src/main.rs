use anyhow::{Context, Result};
use toolnexus_runtime::{
    build_runtime,
    config::{Config, LogFormat},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load runtime config")?;
    init_tracing(config.log_format);

    let runtime = build_runtime(config).await?;
    if let Some(db) = &runtime.db {
        db.migrate().await?;
    }

    let health = runtime.telemetry_worker.health();
    let worker = runtime.telemetry_worker.spawn();
    info!(
        service = %runtime.config.service_name,
        instance_id = %runtime.config.instance_id,
        log_format = runtime.config.log_format.as_str(),
        "runtime started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!(
        pending = runtime.ingest.pending(),
        state = ?health.state(),
        "shutdown requested"
    );
    worker.shutdown().await.context("join telemetry worker")?;
    let snapshot = health.snapshot();
    info!(
        processed = snapshot.processed,
        failed_attempts = snapshot.failed_attempts,
        discarded = snapshot.discarded,
        "runtime stopped"
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
