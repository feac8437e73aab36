//! Litter — a peer-to-peer LAN microblog node.
//!
//! Posts are stored locally and gossiped to peers on the same link via
//! IP multicast; periodic pull/gap rounds converge every node on the
//! same per-author timelines. A small HTTP endpoint exposes the local
//! store to a browser UI.

use clap::Parser;
use litter::{Config, Node, DEFAULT_HTTP_PORT, DEFAULT_INTERVAL_SECS};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "litter", version, about = "Litter: LAN microblog over multicast")]
struct Args {
    /// IPv4 address of an interface to join/emit on (repeatable)
    #[arg(short, long = "interface")]
    interfaces: Vec<Ipv4Addr>,

    /// Node identity (defaults to the host name)
    #[arg(short, long)]
    name: Option<String>,

    /// HTTP port for the local UI
    #[arg(short, long, default_value_t = DEFAULT_HTTP_PORT)]
    port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory holding the web UI files
    #[arg(long, default_value = "./web")]
    web_root: PathBuf,

    /// Seconds between anti-entropy rounds
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: u64,
}

fn default_uid() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "litter".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("litter=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let uid = args.name.unwrap_or_else(default_uid);

    let config = Config {
        uid: uid.clone(),
        interfaces: args.interfaces,
        http_port: args.port,
        data_dir: args.data_dir,
        web_root: args.web_root,
        interval_secs: args.interval,
        ..Default::default()
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  Litter v{VERSION} — LAN microblog");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "uid: {} | group: {}:{} | http: {}",
        uid, config.mcast_group, config.mcast_port, config.http_port
    );
    if !config.interfaces.is_empty() {
        info!("interfaces: {:?}", config.interfaces);
    }

    let node = match Node::start(config).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {e}");
            std::process::exit(1);
        }
    };

    info!("litter running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    node.shutdown().await;
}
