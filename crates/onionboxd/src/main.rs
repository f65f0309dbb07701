//! onionboxd: ephemeral file sharing daemon
//!
//! Usage:
//!   onionboxd [--config /etc/onionbox/config.toml] [--listen 127.0.0.1:8080]
//!
//! Uploaded files are zipped into pinned memory, optionally encrypted, and
//! served until their download limit or expiry is reached. Nothing is ever
//! written to disk; every package is wiped on shutdown.

mod daemon;
mod http;
mod metrics;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use onionbox_core::config::OnionboxConfig;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "onionboxd", version, about = "Ephemeral file sharing daemon")]
struct Cli {
    /// Path to onionbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "ONIONBOX_CONFIG",
        default_value = "/etc/onionbox/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to daemon.log_level
    #[arg(long, env = "ONIONBOX_LOG")]
    log: Option<String>,

    /// Log format (json, text); defaults to daemon.log_format
    #[arg(long, env = "ONIONBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// HTTP listen address, overrides daemon.listen
    #[arg(long)]
    listen: Option<String>,

    /// Chunk size in bytes, overrides upload.chunk_size
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it supplies the logging defaults
    let (mut config, found) = load_config(&cli.config).await?;
    apply_overrides(&mut config, &cli);

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        LogFormat::from_str(&config.daemon.log_format, true).unwrap_or(LogFormat::Text)
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "onionboxd starting"
    );
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<(OnionboxConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((OnionboxConfig::default(), false))
    }
}

fn apply_overrides(config: &mut OnionboxConfig, cli: &Cli) {
    if let Some(listen) = &cli.listen {
        config.daemon.listen = listen.clone();
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.upload.chunk_size = chunk_size;
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
