//! Policy object model (spec.md section 3): read-only snapshots of the
//! objects the MODB resolves for the agent. The agent never mutates these;
//! it only reacts to a new snapshot replacing an old one under the same
//! URI/UUID key.

use std::collections::HashSet;

use opflex_types::{IpAddress, MacAddress};

/// A DHCP relay/announce configuration attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DhcpConfig {
    pub ipv4: Option<Dhcp4Config>,
    pub ipv6: Option<Dhcp6Config>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp4Config {
    pub server_ip: Option<IpAddress>,
    pub lease_seconds: Option<u32>,
    pub dns_servers: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp6Config {
    pub server_ip: Option<IpAddress>,
    pub dns_servers: Vec<IpAddress>,
}

/// A virtual IP the endpoint answers ARP/ND for without actually owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualIp {
    pub mac: MacAddress,
    pub cidr: (IpAddress, u8),
}

/// Floating-IP to mapped-IP NAT binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddressMapping {
    pub floating_ip: IpAddress,
    pub mapped_ip: IpAddress,
    pub nat_epg: String,
    pub next_hop: Option<IpAddress>,
}

/// Endpoint: the basic unit the integration and access flow managers render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uuid: String,
    pub mac: Option<MacAddress>,
    pub ips: Vec<IpAddress>,
    pub interface_name: Option<String>,
    pub access_interface_name: Option<String>,
    pub epg: String,
    pub security_groups: HashSet<String>,
    pub virtual_ips: Vec<VirtualIp>,
    pub ip_mappings: Vec<IpAddressMapping>,
    pub dhcp: DhcpConfig,
    pub promiscuous: bool,
    pub discovery_proxy: bool,
}

impl Endpoint {
    pub fn has_known_mac_and_port(&self) -> bool {
        self.mac.is_some() && self.interface_name.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntraGroupPolicy {
    Allow,
    Deny,
}

/// Endpoint group: one bridge domain, optional flood domain, one routing domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointGroup {
    pub uri: String,
    pub vnid: u32,
    pub bridge_domain: String,
    pub flood_domain: Option<String>,
    pub routing_domain: Option<String>,
    pub intra_group_policy: IntraGroupPolicy,
    pub multicast_group: Option<IpAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFloodMode {
    Drop,
    Flood,
    ProxyUnicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpNdMode {
    Unicast,
    Flood,
    UnicastProxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub uri: String,
    pub cidr: (IpAddress, u8),
    pub router_ip: Option<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDomain {
    pub uri: String,
    pub routing_enabled: bool,
    pub unknown_flood_mode: UnknownFloodMode,
    pub arp_nd_mode: ArpNdMode,
    pub router_mac: Option<MacAddress>,
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodDomain {
    pub uri: String,
    pub unknown_flood_mode: UnknownFloodMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingDomain {
    pub uri: String,
    pub internal_subnets: Vec<(IpAddress, u8)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    In,
    Out,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackMode {
    Normal,
    Reflexive,
}

/// A single classifier + action rule shared by contracts and security groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub direction: RuleDirection,
    pub allow: bool,
    pub eth_type: Option<u16>,
    pub ip_proto: Option<u8>,
    pub l4_src_range: Option<(u16, u16)>,
    pub l4_dst_range: Option<(u16, u16)>,
    pub tcp_flags: Option<(u16, u16)>,
    pub remote_subnets: Vec<(IpAddress, u8)>,
    pub conntrack_mode: Option<ConntrackMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub uri: String,
    pub providers: HashSet<String>,
    pub consumers: HashSet<String>,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub uri: String,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubnet {
    pub cidr: (IpAddress, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3ExternalNetwork {
    pub uri: String,
    pub routing_domain: String,
    pub subnets: Vec<ExternalSubnet>,
    pub nat_epg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMapping {
    pub service_ip: IpAddress,
    pub next_hop_ip: Option<IpAddress>,
    pub gateway_ip: Option<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnycastService {
    pub uuid: String,
    pub interface_name: String,
    pub domain: String,
    pub mappings: Vec<ServiceMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RdConfig {
    pub routing_domain: String,
    pub extra_internal_cidrs: Vec<(IpAddress, u8)>,
}
