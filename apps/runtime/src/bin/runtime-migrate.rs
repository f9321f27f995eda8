use anyhow::{Context, Result, anyhow};
use clap::Parser;
use toolnexus_runtime::db::RuntimeDb;

#[derive(Parser, Debug)]
struct Args {
    /// Postgres URL. Falls back to DB_URL, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let database_url = args
        .database_url
        .or_else(|| std::env::var("DB_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("no database url: pass --database-url or set DB_URL"))?;

    let db = RuntimeDb::connect(database_url.trim())
        .await
        .context("connect for migration")?;
    db.migrate().await?;
    tracing::info!("runtime migrations complete");
    Ok(())
}
