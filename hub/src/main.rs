//! Flash-sync hub: coordinates recording devices on the local network.
//!
//! This binary:
//! 1. Reads configuration from `hub.conf`
//! 2. Runs the command server devices connect to
//! 3. Runs the file transfer receiver for post-session uploads
//! 4. Answers UDP clock requests
//! 5. Optionally serves the HTTP status API and advertises itself over mDNS

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use flashsync_common::config::{self, HubConfig};
use flashsync_common::discovery;
use flashsync_common::session::SessionStore;
use flashsync_hub::status::{AppState, StatusTask};
use flashsync_hub::{CommandServer, FileTransferServer, UdpTimeServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| HubConfig::default_path().to_string());
    let config = if PathBuf::from(&config_path).exists() {
        config::load(&PathBuf::from(&config_path)).context("Config load failed")?
    } else {
        warn!("No config at {config_path}, using defaults");
        HubConfig::default()
    };

    info!(
        "Flash-sync hub starting (commands={}, transfers={}, data={})",
        config.command_listen_addr,
        config.transfer_listen_addr,
        config.data_dir.display()
    );

    std::fs::create_dir_all(&config.data_dir).context("Cannot create data directory")?;
    let store = Arc::new(SessionStore::new(&config.data_dir));

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── servers ──────────────────────────────────────────────────────
    let commands = Arc::new(CommandServer::start(&config).await?);
    let transfers = FileTransferServer::start(&config, store.clone()).await?;

    let time_responder = match &config.timesync_listen_addr {
        Some(addr) => Some(UdpTimeServer::start(addr, config.accept_poll).await?),
        None => None,
    };

    let status_task = config.status_listen_addr.clone().map(|addr| {
        let state = AppState::new(commands.clone(), store.clone());
        StatusTask::spawn(state, addr, shutdown.clone())
    });

    // Registration failure only costs discoverability.
    let registration = if config.mdns_enable {
        let port = commands.local_addr().port();
        match tokio::task::spawn_blocking(move || discovery::register(port)).await? {
            Ok(reg) => Some(reg),
            Err(e) => {
                warn!("mDNS registration failed: {e:#}");
                None
            }
        }
    } else {
        None
    };

    // ── run until signalled ──────────────────────────────────────────
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    if let Some(reg) = registration {
        reg.shutdown();
    }
    commands.stop().await;
    transfers.stop().await;
    if let Some(responder) = &time_responder {
        responder.stop().await;
    }
    if let Some(task) = status_task {
        task.join().await;
    }

    info!("Flash-sync hub stopped");
    Ok(())
}
