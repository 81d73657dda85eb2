//! # Buntime Gateway Binary
//!
//! Boot sequence: parse arguments, initialize tracing, load configuration
//! (file + environment), assemble the runtime and serve until interrupted.
//!
//! ```bash
//! WORKER_DIRS=./apps buntime-gateway
//! buntime-gateway --config buntime.toml --port 8080
//! ```

use buntime_gateway::config::RuntimeConfig;
use buntime_gateway::server::create_server;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the runtime configuration file (TOML). Environment variables
    /// override file values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the bind address.
    #[arg(long)]
    host: Option<String>,

    /// Log filter, e.g. "info" or "buntime_gateway=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = RuntimeConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let (app, runtime) = create_server(config).await?;

    tracing::info!("buntime gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received");
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}
