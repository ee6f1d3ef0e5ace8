#![forbid(unsafe_code)]

//! Marlin relay: joins the overlay through a beacon server and relays
//! pubsub traffic. Runs single-threaded; multi-core deployments run one
//! process per core.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use marlin_beacon::{BeaconEvent, DiscoveryClient, DiscoveryConfig};
use marlin_core::config::ContractSet;
use marlin_core::{RelayConfig, SocketAddress};
use marlin_crypto::keystore;
use marlin_pubsub::{
    LpfBloomWitnesser, PubSubConfig, PubSubNode, PubsubEvent, SigAttester,
    MASTER_PUBSUB_PROTOCOL_NUMBER,
};
use marlin_stream::StreamTransportFactory;
use rand::RngCore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Contracts {
    Mainnet,
    Kovan,
}

#[derive(Parser, Debug)]
#[command(name = "marlin-relay", about = "Marlin pubsub relay node")]
struct Args {
    /// Bind address for the discovery client.
    #[arg(long, default_value = "127.0.0.1:8002")]
    discovery_addr: SocketAddress,
    /// Bind address for the pubsub stream transport.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pubsub_addr: SocketAddress,
    /// Beacon server to register with.
    #[arg(long, default_value = "127.0.0.1:8003")]
    beacon_addr: SocketAddress,
    /// Static key file (created on first run).
    #[arg(long, default_value = "./.marlin/keys/static")]
    keystore_path: String,
    /// Optional keystore passphrase file.
    #[arg(long)]
    keystore_pass_path: Option<String>,
    #[arg(long, value_enum, default_value_t = Contracts::Mainnet)]
    contracts: Contracts,
    /// Optional TOML config file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Cap on solicited pubsub connections.
    #[arg(long, default_value_t = 2)]
    max_sol_conns: usize,
}

fn load_config(args: &Args) -> Result<RelayConfig, marlin_core::Error> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    config.discovery_addr = args.discovery_addr;
    config.pubsub_addr = args.pubsub_addr;
    config.beacon_addr = args.beacon_addr;
    config.keystore_path = args.keystore_path.clone();
    config.keystore_pass_path = args.keystore_pass_path.clone();
    config.max_sol_conns = args.max_sol_conns;
    config.contracts = match args.contracts {
        Contracts::Mainnet => ContractSet::Mainnet,
        Contracts::Kovan => ContractSet::Kovan,
    };
    config.validate()?;
    Ok(config)
}

/// Signing key for attestation, persisted next to the transport key.
fn load_signing_key(keystore_path: &str) -> Result<SigAttester, Box<dyn std::error::Error>> {
    let path = format!("{keystore_path}.sig");
    if let Ok(bytes) = fs::read(&path) {
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("signing key {path}: expected 32 bytes"))?;
        return Ok(SigAttester::new(&secret)?);
    }

    // Fresh key; retry until the bytes land inside the curve order.
    loop {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        if let Ok(attester) = SigAttester::new(&secret) {
            if let Some(dir) = std::path::Path::new(&path).parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, secret)?;
            info!(path, "generated new signing key");
            return Ok(attester);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("relay failed: {e}");
        process::exit(-1);
    }
}

async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = keystore::load_or_generate(&config.keystore_path)?;
    let static_pk = keypair.public_bytes();
    info!(pk = %hex::encode(static_pk), "static identity loaded");

    let attester = load_signing_key(&config.keystore_path)?;
    let witnesser = LpfBloomWitnesser::new(static_pk);

    let (factory, transport_events) =
        StreamTransportFactory::bind(config.pubsub_addr, keypair).await?;
    let pubsub_addr = factory.local_addr();

    let pubsub_config = PubSubConfig {
        max_sol_conns: config.max_sol_conns,
        channels: config.channels.clone(),
        ..Default::default()
    };
    let (node, pubsub, mut messages) = PubSubNode::new(
        factory,
        transport_events,
        attester,
        witnesser,
        static_pk,
        pubsub_config,
    );
    node.start();
    info!(%pubsub_addr, "pubsub node up");

    let mut discovery_config = DiscoveryConfig::new(config.beacon_addr);
    discovery_config.protocols = vec![marlin_beacon::wire::ProtocolEntry {
        protocol: config.protocol,
        version: 0,
        port: pubsub_addr.port(),
    }];
    let (beacon, mut peers) =
        DiscoveryClient::bind(config.discovery_addr, static_pk, discovery_config).await?;
    beacon.start_discovery();

    let accepted_protocol = config.protocol;
    loop {
        tokio::select! {
            peer = peers.recv() => {
                let Some(BeaconEvent::NewPeer { client_key, addr, static_pk, protocol, version }) = peer else {
                    return Err("beacon client stopped".into());
                };
                info!(%client_key, %addr, protocol, version, "new peer");
                if protocol == accepted_protocol || protocol == MASTER_PUBSUB_PROTOCOL_NUMBER {
                    if let Err(e) = pubsub.subscribe(addr, static_pk).await {
                        warn!(%addr, "subscribe failed: {e}");
                    }
                }
            }
            message = messages.recv() => {
                match message {
                    Some(PubsubEvent::DidRecvMessage { message_id, channel, origin, payload }) => {
                        info!(message_id, channel, %origin, bytes = payload.len(), "message relayed");
                    }
                    Some(_) => {}
                    None => return Err("pubsub node stopped".into()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
