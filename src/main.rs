//! tls-relay
//!
//! A TLS-terminating reverse proxy for one fixed backend, built with Tokio,
//! Hyper and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────────┐
//!                      │                     TLS RELAY                      │
//!                      │                                                    │
//!   Client Request     │  ┌─────────┐   ┌─────────┐   ┌──────────────────┐  │
//!   ───────────────────┼─▶│   net   │──▶│  http   │──▶│ request rewrite  │  │
//!                      │  │listener │   │ server  │   │   (director)     │  │
//!                      │  │  + tls  │   └────┬────┘   └────────┬─────────┘  │
//!                      │  └─────────┘        │                 ▼            │
//!                      │               /healthz /readyz  ┌──────────────┐    │
//!                      │                                 │   upstream   │    │
//!                      │                                 │ forwarder +  │────┼──▶ Backend
//!                      │                                 │    pool      │◀───┼───
//!                      │                                 └──────┬───────┘    │
//!   Client Response    │  ┌──────────────┐   ┌──────────────┐   │            │
//!   ◀──────────────────┼──│   response   │◀──│ error → 502  │◀──┘            │
//!                      │  │   modifier   │   │   handler    │                │
//!                      │  └──────────────┘   └──────────────┘                │
//!                      │                                                    │
//!                      │  config · lifecycle (ready → draining → stopped)   │
//!                      │  observability (tracing, metrics, error events)    │
//!                      └────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use tls_relay::lifecycle::{launch, resolve_config};
use tls_relay::observability::{init_logging, metrics};

/// TLS-terminating reverse proxy for a single backend.
#[derive(Debug, Parser)]
#[command(name = "tls-relay", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tls-relay starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.url,
        max_connections = config.listener.max_connections,
        read_timeout_ms = config.timeouts.read_ms,
        drain_timeout_ms = config.timeouts.drain_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(err) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %err,
                "Failed to parse metrics address"
            ),
        }
    }

    launch(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
