use anyhow::{Context, Result};
use assimrun::app::{bootstrap, init_tracing, shutdown_signal};
use assimrun::{AppConfig, DurabilityMode};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Command-line overrides; anything unset comes from the environment.
#[derive(Parser, Debug)]
#[command(name = "assimrun")]
#[command(about = "Data-assimilation run service with durable, resumable event streams")]
struct Cli {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// sync, async or none
    #[arg(long, value_parser = parse_durability)]
    durability: Option<DurabilityMode>,

    #[arg(long)]
    event_ttl_seconds: Option<u64>,

    #[arg(long)]
    emit_partial_every: Option<u32>,
}

impl Cli {
    fn apply(self, mut config: AppConfig) -> AppConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if let Some(durability) = self.durability {
            config.storage.durability = durability;
        }
        if let Some(ttl) = self.event_ttl_seconds {
            config.retention.ttl = std::time::Duration::from_secs(ttl);
        }
        if let Some(every) = self.emit_partial_every {
            config.worker.emit_partial_every = every;
        }
        config
    }
}

fn parse_durability(raw: &str) -> std::result::Result<DurabilityMode, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.apply(AppConfig::from_env().context("failed to read config")?);
    let boot = bootstrap(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.address())
        .await
        .with_context(|| format!("failed to bind {}", config.address()))?;
    info!(address = %config.address(), "listening");

    axum::serve(listener, boot.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum serve error")?;

    boot.shutdown().await
}
