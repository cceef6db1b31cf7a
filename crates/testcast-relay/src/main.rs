//! testcast Relay Server
//!
//! WebSocket relay that forwards test output from the process running a test
//! to the console watching it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use testcast_core::config::load_config;
use testcast_core::tracing_init::{crate_filter, init_tracing};
use testcast_relay::{RelayConfig, RelayServer};

/// Crates whose events the configured log level applies to.
const LOG_TARGETS: &[&str] = &["testcast_relay", "testcast_core"];

#[derive(Parser, Debug)]
#[command(name = "testcast-relay")]
#[command(version, about = "testcast relay server - forwards test output to a watcher")]
struct Args {
    /// Address to listen on (defaults to the configured host and port).
    #[arg(long, env = "TESTCAST_RELAY_ADDR")]
    addr: Option<SocketAddr>,

    /// Project directory to read `.testcast/settings.json` from.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Seconds a rejected connection may linger before it is closed.
    #[arg(long)]
    reject_grace: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = load_config(Some(&project_dir))?;

    init_tracing(&crate_filter(&config.relay.log_level, LOG_TARGETS), args.log_json);

    let addr = match args.addr {
        Some(addr) => addr,
        None => config
            .relay
            .bind_addr()
            .parse()
            .with_context(|| format!("Invalid relay address {}", config.relay.bind_addr()))?,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting testcast-relay"
    );

    let server = RelayServer::new(RelayConfig {
        addr,
        reject_grace: Duration::from_secs(
            args.reject_grace.unwrap_or(config.relay.reject_grace_secs),
        ),
    });
    let bound = server.start().await?;
    info!(addr = %bound, "Relay ready at ws://{}", bound);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    server.stop().await;
    info!("Relay stopped");
    Ok(())
}
