#![forbid(unsafe_code)]

//! Standalone beacon (discovery) server.

use std::process;

use clap::Parser;
use marlin_beacon::DiscoveryServer;
use marlin_core::SocketAddress;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "marlin-beacon", about = "Marlin beacon server")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:8003")]
    beacon_addr: SocketAddress,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let server = match DiscoveryServer::bind(args.beacon_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("bind failed: {e}");
            process::exit(1);
        }
    };
    info!(addr = %server.local_addr(), "beacon server running");

    let task = server.start();
    tokio::select! {
        _ = task => error!("beacon server stopped unexpectedly"),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
}
