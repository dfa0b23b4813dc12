use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::net::{IpAddr, Ipv4Addr};
use tracing::info;

/// One local egress interface, identified by its bound IPv4 address.
#[derive(Debug, Clone)]
pub struct NicInfo {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Enumerate interfaces that are up, not loopback, and carry an IPv4
/// address. One entry per interface; the last listed address wins.
pub fn discover() -> Result<Vec<NicInfo>> {
    let addrs = getifaddrs().context("failed to enumerate network interfaces")?;

    let mut nics: Vec<NicInfo> = Vec::new();
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(sockaddr) = ifaddr.address else {
            continue;
        };
        let Some(sin) = sockaddr.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if ip.is_loopback() {
            continue;
        }
        if let Some(existing) = nics.iter_mut().find(|n| n.name == ifaddr.interface_name) {
            existing.ip = ip;
        } else {
            nics.push(NicInfo {
                name: ifaddr.interface_name.clone(),
                ip,
            });
        }
    }

    for nic in &nics {
        info!("found egress interface {} ({})", nic.ip, nic.name);
    }
    Ok(nics)
}

impl NicInfo {
    pub fn ip_addr(&self) -> IpAddr {
        IpAddr::V4(self.ip)
    }
}
