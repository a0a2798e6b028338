//! Tunnel Network Settings
//!
//! Computes what the routing collaborator installs for a tunnel: a virtual
//! interface address that does not clash with local networks, the default
//! route, the private/reserved IPv4 ranges that must bypass the tunnel, and
//! the DNS servers used inside it.

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Candidate virtual addresses, keyed by the first octet they occupy
const VPN_ADDRESS_CANDIDATES: &[(u8, Ipv4Addr)] = &[
    (10, Ipv4Addr::new(10, 111, 222, 0)),
    (172, Ipv4Addr::new(172, 16, 9, 1)),
    (192, Ipv4Addr::new(192, 168, 20, 1)),
    (169, Ipv4Addr::new(169, 254, 19, 0)),
];

/// Ranges that never go through the tunnel
const EXCLUDED_SUBNETS: &[&str] = &[
    "10.0.0.0/8",
    "100.64.0.0/10",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.31.196.0/24",
    "192.52.193.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "192.175.48.0/24",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
];

const DNS_SERVERS: &[Ipv4Addr] = &[
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(9, 9, 9, 9),
    Ipv4Addr::new(208, 67, 222, 222),
    Ipv4Addr::new(208, 67, 220, 220),
];

/// IPv4 subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    /// The default route (0.0.0.0/0)
    pub const DEFAULT_ROUTE: Subnet = Subnet {
        address: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    /// Parse CIDR notation (e.g., "10.0.0.0/8")
    pub fn parse(cidr: &str) -> Option<Self> {
        let (address, prefix) = cidr.split_once('/')?;
        let address: Ipv4Addr = address.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;

        if prefix > 32 {
            return None;
        }
        Some(Self { address, prefix })
    }

    /// Netmask as an address (e.g., 255.255.255.0 for /24)
    pub fn mask(&self) -> Ipv4Addr {
        let bits = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(bits)
    }

    /// Check whether an address falls inside this subnet
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask());
        u32::from(addr) & mask == u32::from(self.address) & mask
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Subnets excluded from the tunnel
pub fn excluded_routes() -> Vec<Subnet> {
    EXCLUDED_SUBNETS.iter().filter_map(|s| Subnet::parse(s)).collect()
}

/// Pick a virtual address whose first octet no local interface uses.
///
/// Falls back to any candidate when every range is taken.
pub fn select_vpn_address(local_addresses: &[Ipv4Addr]) -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    let free = VPN_ADDRESS_CANDIDATES
        .iter()
        .filter(|(octet, _)| !local_addresses.iter().any(|a| a.octets()[0] == *octet))
        .map(|(_, addr)| *addr);

    match free.choose(&mut rng) {
        Some(addr) => addr,
        None => VPN_ADDRESS_CANDIDATES
            .iter()
            .map(|(_, addr)| *addr)
            .choose(&mut rng)
            .unwrap_or(Ipv4Addr::new(10, 111, 222, 0)),
    }
}

/// Interface settings installed for one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Server the tunnel relays to
    pub tunnel_remote_address: String,
    /// Virtual interface address
    pub address: Ipv4Addr,
    /// Virtual interface netmask
    pub subnet_mask: Ipv4Addr,
    /// Routes sent through the tunnel
    pub included_routes: Vec<Subnet>,
    /// Routes that bypass the tunnel
    pub excluded_routes: Vec<Subnet>,
    /// DNS servers used inside the tunnel
    pub dns_servers: Vec<IpAddr>,
}

impl NetworkSettings {
    /// Settings for a tunnel to `remote`, avoiding the given local addresses
    pub fn for_remote(remote: impl Into<String>, local_addresses: &[Ipv4Addr]) -> Self {
        Self {
            tunnel_remote_address: remote.into(),
            address: select_vpn_address(local_addresses),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            included_routes: vec![Subnet::DEFAULT_ROUTE],
            excluded_routes: excluded_routes(),
            dns_servers: DNS_SERVERS.iter().map(|a| IpAddr::V4(*a)).collect(),
        }
    }
}
