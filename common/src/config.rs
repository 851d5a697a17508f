//! Configuration parsing: reads a `KEY=VALUE` file (default
//! `/etc/flashsync/hub.conf`).
//!
//! Every key is optional; missing or unparsable values fall back to the
//! defaults of [`HubConfig::default`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Hub configuration shared by the command server, the transfer receiver
/// and the status API.
#[derive(Debug, Clone)]
pub struct HubConfig {
    // ── storage ──────────────────────────────────────────────────────
    /// Root under which every session directory is created.
    pub data_dir: PathBuf,

    // ── network ──────────────────────────────────────────────────────
    pub command_listen_addr: String,
    pub transfer_listen_addr: String,
    /// Port advertised to devices in `transfer_files` acks.
    pub transfer_port: u16,
    /// HTTP status API; `None` disables it.
    pub status_listen_addr: Option<String>,
    /// UDP time responder; `None` disables it.
    pub timesync_listen_addr: Option<String>,

    // ── timeouts ─────────────────────────────────────────────────────
    /// How often blocked accept loops re-check the shutdown flag.
    pub accept_poll: Duration,
    /// A command client silent for this long is disconnected.
    pub client_idle_timeout: Duration,
    /// Per-read/write timeout of file transfer connections.
    pub transfer_io_timeout: Duration,
    /// Upper bound on waiting for handler tasks during shutdown.
    pub shutdown_join: Duration,

    // ── limits ───────────────────────────────────────────────────────
    pub header_limit_bytes: usize,

    // ── discovery ────────────────────────────────────────────────────
    pub mdns_enable: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pc_controller_data"),
            command_listen_addr: "0.0.0.0:8080".into(),
            transfer_listen_addr: "0.0.0.0:8082".into(),
            transfer_port: 8082,
            status_listen_addr: Some("0.0.0.0:8089".into()),
            timesync_listen_addr: Some("0.0.0.0:8081".into()),
            accept_poll: Duration::from_millis(500),
            client_idle_timeout: Duration::from_secs(30),
            transfer_io_timeout: Duration::from_secs(10),
            shutdown_join: Duration::from_millis(2000),
            header_limit_bytes: 1024 * 1024,
            mdns_enable: false,
        }
    }
}

impl HubConfig {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/flashsync/hub.conf"
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<HubConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text);
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`HubConfig`] from the text of a config file.
pub fn from_str(text: &str) -> HubConfig {
    let map = parse_conf(text);
    let defaults = HubConfig::default();

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        match get(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid {key}={v:?}, using {default}");
                default
            }),
            None => default,
        }
    };

    let transfer_listen_addr = get("TRANSFER_LISTEN_ADDR")
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.transfer_listen_addr);
    // The advertised port follows the listener unless set explicitly.
    let transfer_port = get("TRANSFER_PORT")
        .and_then(|v| v.parse().ok())
        .or_else(|| port_of(&transfer_listen_addr))
        .unwrap_or(defaults.transfer_port);

    let optional_addr = |key: &str, default: Option<String>| match get(key) {
        Some(v) if v.is_empty() => None,
        Some(v) => Some(v),
        None => default,
    };
    let status_listen_addr = optional_addr("STATUS_LISTEN_ADDR", defaults.status_listen_addr);
    let timesync_listen_addr =
        optional_addr("TIMESYNC_LISTEN_ADDR", defaults.timesync_listen_addr);

    HubConfig {
        data_dir: get("DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir),
        command_listen_addr: get("COMMAND_LISTEN_ADDR")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.command_listen_addr),
        transfer_listen_addr,
        transfer_port,
        status_listen_addr,
        timesync_listen_addr,
        accept_poll: Duration::from_millis(get_u64("ACCEPT_POLL_MS", 500).max(1)),
        client_idle_timeout: Duration::from_secs(get_u64("CLIENT_IDLE_TIMEOUT_SECS", 30)),
        transfer_io_timeout: Duration::from_secs(get_u64("TRANSFER_IO_TIMEOUT_SECS", 10)),
        shutdown_join: Duration::from_millis(get_u64("SHUTDOWN_JOIN_MS", 2000)),
        header_limit_bytes: get_u64("HEADER_LIMIT_BYTES", defaults.header_limit_bytes as u64)
            as usize,
        mdns_enable: get("MDNS_ENABLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.mdns_enable),
    }
}

fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
