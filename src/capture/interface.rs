//! Capture interface lookup via pnet's datalink enumeration.

use pnet::datalink::{self, NetworkInterface};
use std::net::IpAddr;

use crate::error::CaptureError;

/// Display summary of one local interface, for `--list-interfaces`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub addresses: Vec<IpAddr>,
}

impl std::fmt::Display for InterfaceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.up { "up" } else { "down" };
        write!(f, "{:<16} {:<5}", self.name, state)?;
        if self.loopback {
            write!(f, " loopback")?;
        }
        if !self.addresses.is_empty() {
            let addrs: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
            write!(f, " {}", addrs.join(", "))?;
        }
        Ok(())
    }
}

impl From<&NetworkInterface> for InterfaceSummary {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            addresses: iface.ips.iter().map(|net| net.ip()).collect(),
        }
    }
}

/// Every interface the system reports
pub fn list_interfaces() -> Vec<InterfaceSummary> {
    datalink::interfaces().iter().map(InterfaceSummary::from).collect()
}

/// Look up an interface by exact name
pub fn find_interface(name: &str) -> Result<NetworkInterface, CaptureError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| CaptureError::InterfaceNotFound(name.to_string()))
}
