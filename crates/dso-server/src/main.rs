//! The `dso-server` binary.

use std::path::PathBuf;

use clap::Parser;

use dso_server::{build_router, logging, AppState, ServerConfig};

/// Schema-driven REST/geospatial API gateway.
#[derive(Debug, Parser)]
#[command(name = "dso-server", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "DSO_CONFIG", default_value = "dso.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let cli = Cli::parse();
    let config = ServerConfig::from_file(&cli.config)?;
    let bind = config.bind.clone();

    // Startup fails hard when the schema source is unreachable.
    let state = AppState::initialize(config).await?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "dso-server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
