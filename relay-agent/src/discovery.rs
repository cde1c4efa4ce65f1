//! Host identification for device registration
//!
//! Picks the primary MAC with priority Ethernet > Wireless > other and
//! reports the address and hostname the device registers with.

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// What the device tells the store about the host it runs on
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceIdentity {
    /// Never fails: a host without usable interfaces registers without a MAC
    pub fn discover() -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let mut identity = DeviceIdentity {
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            mac_address: None,
            ip_address: None,
        };

        match enumerate_interfaces() {
            Ok(interfaces) => {
                if let Some(primary) = select_primary(&interfaces) {
                    identity.mac_address = Some(primary.mac.clone());
                    identity.ip_address = Some(primary.ip.clone());
                }
            }
            Err(e) => warn!("Interface discovery failed: {:#}", e),
        }

        info!(
            "Host {} ({}/{}), MAC {}",
            identity.hostname,
            identity.os,
            identity.architecture,
            identity.mac_address.as_deref().unwrap_or("unknown")
        );
        identity
    }
}

fn enumerate_interfaces() -> Result<Vec<NetworkInterface>> {
    let addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;
    let mut interfaces = Vec::new();

    for addr in addrs {
        if addr.is_loopback() {
            continue;
        }
        // The store shows one address; prefer IPv4 entries
        let ip = match addr.addr {
            IfAddr::V4(v4) => v4.ip.to_string(),
            IfAddr::V6(_) => continue,
        };
        match mac_address::mac_address_by_name(&addr.name) {
            Ok(Some(mac)) => {
                let interface = NetworkInterface {
                    name: addr.name.clone(),
                    mac: format_mac(&mac.bytes()),
                    ip,
                    interface_type: classify_interface(&addr.name),
                };
                debug!("Found interface: {} ({})", interface.name, interface.mac);
                interfaces.push(interface);
            }
            Ok(None) => debug!("No MAC found for interface: {}", addr.name),
            Err(e) => debug!("Error getting MAC for {}: {}", addr.name, e),
        }
    }
    Ok(interfaces)
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wlp", "wlo", "wifi"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Wireless;
    }
    if ["eth", "en"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

fn select_primary(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    let by_type = |kind| interfaces.iter().find(|i| i.interface_type == kind);
    by_type(InterfaceType::Ethernet)
        .or_else(|| by_type(InterfaceType::Wireless))
        .or_else(|| {
            let first = interfaces.first();
            if let Some(i) = first {
                warn!("No Ethernet/WiFi found, using first interface: {}", i.name);
            }
            first
        })
}
