//! Socket acceptor registrations.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Transport protocol of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

/// What sockets an inbound tunnel wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFilter {
    /// Bind address.
    pub address: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
    pub protocol: SocketProtocol,
    /// If non-empty, only peers inside one of these networks are accepted.
    pub whitelist: Vec<IpNet>,
    /// Peers inside one of these networks are rejected.
    pub blacklist: Vec<IpNet>,
    pub nodelay: bool,
}

impl SocketFilter {
    pub fn tcp(address: IpAddr, port_min: u16, port_max: u16) -> Self {
        Self {
            address,
            port_min,
            port_max,
            protocol: SocketProtocol::Tcp,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            nodelay: true,
        }
    }

    /// Ports to listen on, inclusive.
    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.port_min..=self.port_max
    }

    /// Whether a connection from `peer` may be handed to the tunnel.
    ///
    /// The deny list wins over the allow list.
    pub fn allows(&self, peer: IpAddr) -> bool {
        let peer = canonical(peer);
        if self.blacklist.iter().any(|net| net.contains(&peer)) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|net| net.contains(&peer))
    }
}

// IPv4-mapped IPv6 peers from dual-stack sockets match IPv4 networks.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}
