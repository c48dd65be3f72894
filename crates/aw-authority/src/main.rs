//! # aw-authority
//!
//! AppWall authority server: rule store, agent distribution and the
//! search-and-block API.
//!
//! ## Usage
//!
//! ```text
//! aw-authority --config /etc/appwall/authority.toml
//! aw-authority --state-dir /var/lib/appwall --bind 0.0.0.0:7300
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aw_authority::{router, AppState, AuthorityConfig};

/// AppWall authority server.
#[derive(Parser)]
#[command(name = "aw-authority", version, about = "AppWall authority server")]
struct Cli {
    /// Path to authority.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `.appwall/` state when no config file is given.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Listen address (overrides the config file).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("aw_authority=info".parse()?)
        .add_directive("tower_http=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let mut config = match &cli.config {
        Some(path) => AuthorityConfig::load(path)?,
        None => AuthorityConfig::for_dir(&cli.state_dir),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    tracing::info!("Starting AppWall authority");
    tracing::info!("State directory: {}", config.state_dir.display());

    let state = Arc::new(AppState::open(&config).context("failed to open authority state")?);
    tracing::info!(
        version = %state.store.version(),
        applications = state.catalog.len(),
        "rule store ready"
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    tracing::info!("Listening on {}", config.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    tracing::info!("AppWall authority stopped");
    Ok(())
}
