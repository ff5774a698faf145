//! Arbor Daemon
//!
//! Hosts the Arbor runtime:
//! - tenants, companies and sessions on the configured data backend
//! - extensions loaded from the extensions directory
//! - idle-session reaping and workflow housekeeping

use arbor_daemon::{DaemonConfig, DaemonResult, Server};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Arbor Daemon CLI
#[derive(Parser)]
#[command(name = "arbord")]
#[command(about = "Arbor Daemon - multi-tenant business runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ARBOR_CONFIG")]
    config: Option<String>,

    /// Extensions directory (overrides the configuration file)
    #[arg(short, long, env = "ARBOR_EXTENSIONS_DIR")]
    extensions_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "ARBOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "ARBOR_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Override with CLI args
    if let Some(dir) = cli.extensions_dir {
        config.runtime.extensions.extensions_dir = Some(dir);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        system_database = %config.runtime.data.system_database,
        extensions_dir = ?config.runtime.extensions.extensions_dir,
        "Starting Arbor daemon"
    );

    let server = Server::new(config).await?;
    server.run().await
}
