//! Plexus Broker - routes RPC calls between connected participants.
//!
//! Listens on a Unix domain socket, prints the socket path on stdout for the
//! process that spawned it, and runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use plexus_core::{platform, Broker};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "plexus-broker")]
#[command(about = "RPC broker for Plexus participants")]
struct Args {
    /// Socket path (defaults to $XDG_RUNTIME_DIR/plexus.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Plexus broker");

    let socket = args.socket.unwrap_or_else(platform::default_socket_path);
    let mut broker = Broker::start(&socket)
        .await
        .with_context(|| format!("failed to start broker on {}", socket.display()))?;

    // Intentional stdout: the spawning process reads this line
    println!("BROKER_SOCKET={}", broker.path().display());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    broker.shutdown();

    Ok(())
}
