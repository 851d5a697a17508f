//! mDNS-SD advertisement of the hub.
//!
//! The hub registers its command port under `_gsr-controller._tcp.local.`
//! with a sequential instance name (`hub-01`, `hub-02`, ...) so several hubs
//! on one network stay distinguishable. Devices and tools use
//! [`browse_hubs`] to find them without a configured address.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info};

/// Service type advertised by hubs.
pub const SERVICE_TYPE: &str = "_gsr-controller._tcp.local.";

/// Prefix of hub instance names.
pub const INSTANCE_PREFIX: &str = "hub";

/// How long to scan for other hubs before claiming an instance number.
const REGISTER_SCAN: Duration = Duration::from_secs(2);

/// A hub seen on the network.
#[derive(Debug, Clone)]
pub struct HubPeer {
    /// Instance name, e.g. `hub-01`.
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    /// Command server port.
    pub port: u16,
}

impl HubPeer {
    /// Socket address of the command server, preferring IPv4.
    pub fn command_addr(&self) -> Option<SocketAddr> {
        let ip = self
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addresses.first())?;
        Some(SocketAddr::new(*ip, self.port))
    }
}

/// Keeps the registration alive; dropping it without [`shutdown`] leaves
/// the record to expire on its own.
///
/// [`shutdown`]: Registration::shutdown
pub struct Registration {
    daemon: ServiceDaemon,
    instance_name: String,
    fullname: String,
}

impl Registration {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Withdraw the record and stop the daemon.
    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Advertise a hub whose command server listens on `port`.
pub fn register(port: u16) -> Result<Registration> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;

    let existing: BTreeSet<u32> = scan(&daemon, REGISTER_SCAN)?
        .iter()
        .filter_map(|p| parse_instance_number(&p.instance_name))
        .collect();

    let instance_name = format!("{INSTANCE_PREFIX}-{:02}", next_available(&existing));
    let host = format!("{instance_name}.local.");
    let service_info = ServiceInfo::new(SERVICE_TYPE, &instance_name, &host, "", port, None)
        .context("Cannot create mDNS ServiceInfo")?
        .enable_addr_auto();

    let fullname = service_info.get_fullname().to_string();
    daemon
        .register(service_info)
        .context("Cannot register mDNS service")?;

    info!("Registered on mDNS as '{instance_name}' ({SERVICE_TYPE}, port {port})");

    Ok(Registration {
        daemon,
        instance_name,
        fullname,
    })
}

/// Collect hub advertisements for up to `timeout`.
pub fn browse_hubs(timeout: Duration) -> Result<Vec<HubPeer>> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;
    let peers = scan(&daemon, timeout);
    let _ = daemon.shutdown();
    peers
}

fn scan(daemon: &ServiceDaemon, timeout: Duration) -> Result<Vec<HubPeer>> {
    let receiver = daemon.browse(SERVICE_TYPE).context("Cannot browse mDNS")?;
    let deadline = Instant::now() + timeout;
    let mut peers = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let peer = HubPeer {
                    instance_name: instance_of(info.get_fullname()).to_string(),
                    addresses: info.get_addresses().iter().map(|a| a.to_ip_addr()).collect(),
                    port: info.get_port(),
                };
                debug!("mDNS: found hub {} on port {}", peer.instance_name, peer.port);
                peers.push(peer);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    Ok(peers)
}

/// `hub-03` from `hub-03._gsr-controller._tcp.local.`
fn instance_of(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

fn parse_instance_number(instance: &str) -> Option<u32> {
    instance
        .strip_prefix(INSTANCE_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Smallest positive integer not in `used`.
fn next_available(used: &BTreeSet<u32>) -> u32 {
    (1..).find(|n| !used.contains(n)).unwrap_or(1)
}
