//! Agent configuration (spec.md section 6's environment/config table):
//! a JSON document loaded once at startup, mirroring the real agent's
//! `agent-ovs.conf` nesting rather than a flat flag set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use opflex_types::MacAddress;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncapType {
    Vxlan,
    Ivxlan,
    Vlan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EncapConfig {
    #[serde(rename = "type")]
    pub encap_type: EncapType,
    pub iface: String,
    pub uplink_iface: String,
    pub uplink_vlan: u16,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
}

impl Default for EncapConfig {
    fn default() -> Self {
        Self {
            encap_type: EncapType::Vxlan,
            iface: "br-int_vxlan0".to_string(),
            uplink_iface: String::new(),
            uplink_vlan: 0,
            remote_ip: None,
            remote_port: 4789,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct VirtualRouterIpv6Config {
    pub router_advertisement: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VirtualRouterConfig {
    pub enabled: bool,
    pub mac: MacAddress,
    pub ipv6: VirtualRouterIpv6Config,
}

impl Default for VirtualRouterConfig {
    fn default() -> Self {
        Self { enabled: true, mac: MacAddress::new([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]), ipv6: VirtualRouterIpv6Config::default() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VirtualDhcpConfig {
    pub enabled: bool,
    pub mac: MacAddress,
}

impl Default for VirtualDhcpConfig {
    fn default() -> Self {
        Self { enabled: true, mac: MacAddress::new([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelEndpointMode {
    Unicast,
    MulticastGroup,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EndpointAdvertisementsConfig {
    pub enabled: bool,
    pub mode: crate::advert::Mode,
    pub tunnel_endpoint_mode: TunnelEndpointMode,
    pub tunnel_endpoint_interval_secs: u64,
}

impl Default for EndpointAdvertisementsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: crate::advert::Mode::GratuitousBroadcast,
            tunnel_endpoint_mode: TunnelEndpointMode::Unicast,
            tunnel_endpoint_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ZoneRangeConfig {
    pub start: u32,
    pub end: u32,
}

impl Default for ZoneRangeConfig {
    fn default() -> Self {
        Self { start: 1, end: 65000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectionTrackingConfig {
    pub enabled: bool,
    pub zone_range: ZoneRangeConfig,
}

impl Default for ConnectionTrackingConfig {
    fn default() -> Self {
        Self { enabled: true, zone_range: ZoneRangeConfig::default() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ForwardingConfig {
    pub virtual_router: VirtualRouterConfig,
    pub virtual_dhcp: VirtualDhcpConfig,
    pub endpoint_advertisements: EndpointAdvertisementsConfig,
    pub connection_tracking: ConnectionTrackingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StatsKindConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for StatsKindConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneveDropLogConfig {
    pub int_br_iface: String,
    pub access_br_iface: String,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
    pub local_port: u16,
}

impl Default for GeneveDropLogConfig {
    fn default() -> Self {
        Self {
            int_br_iface: "int-droplog".to_string(),
            access_br_iface: "access-droplog".to_string(),
            remote_ip: None,
            remote_port: 6081,
            local_port: 6081,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct DropLogConfig {
    pub geneve: GeneveDropLogConfig,
}

/// Top-level agent configuration, loaded once from a JSON file at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub ovs_bridge_name: String,
    pub int_bridge_name: String,
    pub access_bridge_name: String,
    pub encap: EncapConfig,
    pub forwarding: ForwardingConfig,
    pub statistics: HashMap<String, StatsKindConfig>,
    pub flowid_cache_dir: PathBuf,
    pub mcast_group_file: PathBuf,
    pub drop_log: DropLogConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ovs_bridge_name: "br-int".to_string(),
            int_bridge_name: "br-int".to_string(),
            access_bridge_name: "br-access".to_string(),
            encap: EncapConfig::default(),
            forwarding: ForwardingConfig::default(),
            statistics: HashMap::new(),
            flowid_cache_dir: PathBuf::from("/var/lib/opflex-agent/ids"),
            mcast_group_file: PathBuf::from("/var/lib/opflex-agent/mcast-groups.json"),
            drop_log: DropLogConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads and parses a JSON config file. Missing sections fall back to
    /// their defaults (spec.md doesn't mandate required keys).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}
