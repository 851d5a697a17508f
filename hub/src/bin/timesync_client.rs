//! Measure a device clock's offset against a hub and store it in the
//! session's `session_metadata.json`.
//!
//! Runs the repeated `time_sync` exchange from this machine, so the result
//! describes this machine's clock relative to the hub. The hub address is
//! taken from `--hub` or found over mDNS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flashsync_common::client::HubClient;
use flashsync_common::discovery;
use flashsync_common::session::SessionStore;
use flashsync_common::timesync::ClockOffsetEstimator;

/// Estimate the clock offset to a flash-sync hub.
#[derive(Parser)]
#[command(name = "timesync_client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Hub command address (host:port); discovered over mDNS when omitted
    #[arg(long)]
    hub: Option<String>,

    /// Session to record the result under
    #[arg(long)]
    session_id: String,

    /// Device name the offset is stored as
    #[arg(long)]
    device: String,

    /// Session storage root
    #[arg(long, default_value = "./pc_controller_data")]
    base_dir: PathBuf,

    /// Number of exchanges
    #[arg(long, default_value_t = 12)]
    trials: u32,

    /// Connect/read timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Reconnect attempts after the first failure
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    let hub: SocketAddr = match &cli.hub {
        Some(addr) => {
            use std::net::ToSocketAddrs;
            addr.to_socket_addrs()
                .with_context(|| format!("Cannot resolve {addr}"))?
                .next()
                .with_context(|| format!("{addr} resolved to nothing"))?
        }
        None => {
            let peers = discovery::browse_hubs(Duration::from_secs(3))?;
            let Some(addr) = peers.iter().find_map(|p| p.command_addr()) else {
                bail!("no hub found over mDNS; pass --hub");
            };
            info!("Using hub at {addr}");
            addr
        }
    };

    let mut client = HubClient::connect_with_retry(hub, timeout, 100, cli.retries)?;
    let estimator = ClockOffsetEstimator::new(cli.trials);
    let stats = estimator.estimate(&mut client)?;

    let store = SessionStore::new(&cli.base_dir);
    store
        .record_clock_sync(&cli.session_id, &cli.device, &stats)
        .context("Cannot write session metadata")?;

    info!(
        "Recorded offset {}ns (delay {}ns, std_dev {}ns) for {} in session {}",
        stats.offset_ns, stats.delay_ns, stats.std_dev_ns, cli.device, cli.session_id
    );
    Ok(())
}
