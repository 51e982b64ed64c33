//! Bootstrap binary: parses a thin CLI, loads configuration, wires up
//! logging, and runs the server until a shutdown signal arrives.

use std::path::PathBuf;

use clap::Parser;
use eyre::Result;
use switchboard::config::load_config;
use switchboard::server::{build_app_state, shutdown_signal, start_server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Switchboard classroom messaging server
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file, layered over environment
    /// variables (file wins).
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Override `http.host:http.port` from the loaded configuration.
    #[clap(short, long, value_parser)]
    bind: Option<String>,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "switchboard=info,tower_http=info".into()),
        1 => tracing_subscriber::EnvFilter::new("switchboard=debug,tower_http=debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(cli.config.as_deref().and_then(|p| p.to_str()))?;
    if let Some(bind) = cli.bind {
        let mut parts = bind.rsplitn(2, ':');
        let port = parts.next().and_then(|p| p.parse().ok());
        let host = parts.next();
        if let (Some(host), Some(port)) = (host, port) {
            config.http.host = host.to_string();
            config.http.port = port;
        }
    }

    info!(database_path = %config.database.path.display(), "building application state");
    let (state, runtime) = build_app_state(config).await?;

    let shutdown = CancellationToken::new();
    let watcher_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        watcher_shutdown.cancel();
    });

    let hub = state.hub.clone();
    let result = start_server(state.clone(), shutdown).await;
    drop(state);
    runtime.shutdown(hub).await;
    info!("shutdown complete");

    if let Err(e) = result {
        error!(error = %e, "server exited with error");
        return Err(e);
    }

    Ok(())
}
