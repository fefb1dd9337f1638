//! Tunnel-Endpoint Manager (C15): periodic local-interface scan that
//! discovers the agent's overlay source identity — IP, MAC and optional
//! VLAN encap — and republishes it on change (spec.md section 4.15).

use std::net::IpAddr;
use std::time::Duration;

use opflex_types::MacAddress;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// One interface as reported by the OS, pre-filtered to what the
/// selection algorithm needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub ipv4: Vec<std::net::Ipv4Addr>,
    pub ipv6: Vec<std::net::Ipv6Addr>,
}

/// Abstracts OS interface enumeration so the selection algorithm is
/// testable without a real NIC. The production implementation walks
/// `nix::ifaddrs::getifaddrs()` for the address/flag data and reads
/// `/sys/class/net/<iface>/address` for the MAC, since `nix` does not
/// itself expose hardware addresses.
pub trait InterfaceSource {
    fn list_interfaces(&self) -> Vec<InterfaceInfo>;
    fn read_mac(&self, interface_name: &str) -> Option<MacAddress>;
}

/// The published tunnel-endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub uuid: String,
    pub termination_ip: IpAddr,
    pub termination_mac: MacAddress,
    pub encap_vlan: Option<u16>,
}

/// Tracks the currently-published tunnel endpoint and re-derives it on
/// each scan.
pub struct TunnelEndpointManager {
    tunnel_ep_uuid: String,
    configured_uplink: Option<String>,
    current: Option<TunnelEndpoint>,
}

impl TunnelEndpointManager {
    pub fn new(tunnel_ep_uuid: impl Into<String>, configured_uplink: Option<String>) -> Self {
        Self { tunnel_ep_uuid: tunnel_ep_uuid.into(), configured_uplink, current: None }
    }

    pub fn current(&self) -> Option<&TunnelEndpoint> {
        self.current.as_ref()
    }

    /// Runs one scan. Returns `Some(endpoint)` exactly when the published
    /// identity changed (including on the first successful scan);
    /// `None` if nothing eligible was found or nothing changed.
    pub fn scan(&mut self, source: &dyn InterfaceSource) -> Option<TunnelEndpoint> {
        let interfaces = source.list_interfaces();

        let chosen = self
            .configured_uplink
            .as_ref()
            .and_then(|name| interfaces.iter().find(|i| &i.name == name))
            .or_else(|| interfaces.iter().find(|i| i.up && !i.loopback && !i.ipv4.is_empty()))?;

        let termination_ip: IpAddr = if let Some(v4) = chosen.ipv4.first() {
            IpAddr::V4(*v4)
        } else {
            IpAddr::V6(*chosen.ipv6.first()?)
        };

        let termination_mac = source.read_mac(&chosen.name)?;
        let encap_vlan = vlan_suffix(&chosen.name);

        let candidate = TunnelEndpoint {
            uuid: self.tunnel_ep_uuid.clone(),
            termination_ip,
            termination_mac,
            encap_vlan,
        };

        if self.current.as_ref() == Some(&candidate) {
            return None;
        }
        self.current = Some(candidate.clone());
        Some(candidate)
    }
}

/// Extracts the VLAN encap from a `.NNN` interface-name suffix, e.g.
/// `eth0.100` -> `Some(100)`.
fn vlan_suffix(name: &str) -> Option<u16> {
    let (_, suffix) = name.rsplit_once('.')?;
    suffix.parse().ok()
}
