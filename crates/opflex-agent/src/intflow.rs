//! Integration Flow Manager (C10) — the core of the CORE.
//!
//! Translates endpoints, endpoint groups, bridge/routing domains and
//! contracts into flows for the ten-table integration pipeline (spec.md
//! section 4.10), and owns the flood-group tables and multicast
//! subscription state those renders depend on.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::warn;
use ofswitch::{Action, Cookie, FlowEntry, GroupBucket, GroupEntry, GroupType, Match, ObjectKey, PortNo, TableId};
use opflex_common::IdGenerator;
use opflex_types::{IpAddress, MacAddress};
use serde::{Deserialize, Serialize};

use crate::policy::{ArpNdMode, BridgeDomain, Contract, Endpoint, EndpointGroup, RdConfig, RoutingDomain, UnknownFloodMode};

/// Fixed integration-pipeline table ids (spec.md section 4.10).
pub mod tables {
    use ofswitch::TableId;

    pub const SEC: TableId = TableId(0);
    pub const SRC: TableId = TableId(1);
    pub const BRIDGE: TableId = TableId(2);
    pub const ROUTE: TableId = TableId(3);
    pub const NAT_IN: TableId = TableId(4);
    pub const LEARN: TableId = TableId(5);
    pub const SERVICE_MAP_DST: TableId = TableId(6);
    pub const POL: TableId = TableId(7);
    pub const STATS: TableId = TableId(8);
    pub const OUT: TableId = TableId(9);
}

/// Metadata register conventions (spec.md section 4.10).
pub mod regs {
    pub const SRC_EPG: u8 = 0;
    pub const DST_EPG: u8 = 2;
    pub const BD: u8 = 4;
    pub const FD: u8 = 5;
    pub const RD: u8 = 6;
    pub const OUT_PORT_OR_GROUP: u8 = 7;
}

pub const MAX_POLICY_RULE_PRIORITY: u16 = 8192;

/// Cookie used for virtual-IP controller-punt flows (v4/v6 variants).
pub const VIP_COOKIE_V4: Cookie = Cookie(0x7650_0004);
pub const VIP_COOKIE_V6: Cookie = Cookie(0x7650_0006);
pub const LEARN_COOKIE: Cookie = Cookie(0x7650_00ea);
/// Cookie used for the ARP/ND proxy-responder controller-punt flows.
pub const ND_COOKIE: Cookie = Cookie(0x7650_000d);
/// Cookie used for the virtual-DHCP-server controller-punt flows.
pub const DHCP_COOKIE: Cookie = Cookie(0x7650_00dc);

/// Per-endpoint membership of a flood/EPG group: the output port and
/// whether the member should receive promiscuous (unfiltered) traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodMember {
    pub port: PortNo,
    pub promiscuous: bool,
}

/// uri -> { uuid -> membership }, materialized as normal + promiscuous
/// group-table entries per flood domain (spec.md section 3 `FloodGroup`).
/// Also carries the configured multicast tunnel destination applied to
/// every flood domain's tunnel-port bucket.
#[derive(Debug, Default)]
pub struct FloodGroupTable {
    groups: HashMap<String, HashMap<String, FloodMember>>,
    mcast_tun_dst: Option<IpAddress>,
}

impl FloodGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, fd_uri: &str, endpoint_uuid: &str, member: FloodMember) {
        self.groups.entry(fd_uri.to_string()).or_default().insert(endpoint_uuid.to_string(), member);
    }

    pub fn remove(&mut self, fd_uri: &str, endpoint_uuid: &str) {
        if let Some(members) = self.groups.get_mut(fd_uri) {
            members.remove(endpoint_uuid);
        }
    }

    /// Sets the multicast tunnel destination applied to every flood
    /// domain's tunnel-port bucket from here on (spec.md section 4.10,
    /// "Platform-config update").
    pub fn set_mcast_tun_dst(&mut self, ip: Option<IpAddress>) {
        self.mcast_tun_dst = ip;
    }

    pub fn mcast_tun_dst(&self) -> Option<IpAddress> {
        self.mcast_tun_dst
    }

    /// Every flood domain with at least one member, for re-emitting group
    /// tables after a platform-config update changes `mcast_tun_dst`.
    pub fn known_domains(&self) -> Vec<String> {
        self.groups.iter().filter(|(_, members)| !members.is_empty()).map(|(fd_uri, _)| fd_uri.clone()).collect()
    }

    /// Builds the normal-mode and promiscuous-mode group entries for a
    /// flood domain given its FD-id and tunnel port. When a multicast
    /// tunnel destination is configured, the tunnel-port bucket sets it as
    /// the outer destination before outputting. Promiscuous group id =
    /// `fd_id | 0x8000_0000`.
    pub fn group_entries(&self, fd_uri: &str, fd_id: u32, tunnel_port: Option<PortNo>) -> Vec<GroupEntry> {
        let members = match self.groups.get(fd_uri) {
            Some(m) if !m.is_empty() => m,
            _ => return vec![],
        };

        let mut normal_buckets = Vec::new();
        let mut promisc_buckets = Vec::new();
        for (idx, member) in members.values().enumerate() {
            let bucket = GroupBucket {
                bucket_id: idx as u32,
                weight: 0,
                watch_port: None,
                actions: vec![Action::Output(member.port)],
            };
            if member.promiscuous {
                promisc_buckets.push(bucket.clone());
            }
            normal_buckets.push(bucket);
        }
        if let Some(port) = tunnel_port {
            let bucket_id = normal_buckets.len() as u32;
            let mut actions = Vec::new();
            if let Some(ip) = self.mcast_tun_dst {
                actions.push(Action::SetIpDst(ip));
            }
            actions.push(Action::Output(port));
            let tunnel_bucket = GroupBucket { bucket_id, weight: 0, watch_port: None, actions };
            normal_buckets.push(tunnel_bucket.clone());
            promisc_buckets.push(tunnel_bucket);
        }

        vec![
            GroupEntry { group_id: ofswitch::GroupId(fd_id), group_type: GroupType::All, buckets: normal_buckets },
            GroupEntry { group_id: ofswitch::GroupId(fd_id | 0x8000_0000), group_type: GroupType::All, buckets: promisc_buckets },
        ]
    }
}

/// Multicast-IP -> set of owner URIs referencing it (an EPG, flood-domain,
/// or platform-config object), refcounted so the last owner leaving an IP
/// drops it (spec.md section 3 `MulticastMap`).
#[derive(Debug, Default)]
pub struct MulticastMap {
    groups: HashMap<String, HashSet<String>>,
}

impl MulticastMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `owner_uri` with `mcast_ip`, dropping any previous
    /// association for that owner first. Returns `true` if the
    /// deduplicated subscribed-IP set changed (an IP gained its first
    /// owner, or an IP lost its last one).
    pub fn update(&mut self, mcast_ip: Option<&str>, owner_uri: &str) -> bool {
        let mut changed = self.remove_owner(owner_uri);
        if let Some(ip) = mcast_ip {
            let owners = self.groups.entry(ip.to_string()).or_default();
            changed |= owners.is_empty();
            owners.insert(owner_uri.to_string());
        }
        changed
    }

    /// Drops `owner_uri` from whichever IP it was associated with. Returns
    /// `true` if that IP's owner set became empty and was removed.
    pub fn remove_owner(&mut self, owner_uri: &str) -> bool {
        let mut emptied = false;
        self.groups.retain(|_, owners| {
            owners.remove(owner_uri);
            let keep = !owners.is_empty();
            emptied |= !keep;
            keep
        });
        emptied
    }

    /// The deduplicated key-set persisted to the multicast-group file.
    pub fn subscribed_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.groups.keys().cloned().collect();
        ips.sort();
        ips
    }
}

/// Registers (or clears) an EPG's own multicast-group subscription in
/// `mcast_map`, keyed by the EPG's URI — the same `MulticastMap` the
/// platform-config object's target IP is tracked in (spec.md section
/// 4.10, EPG update). Returns `true` if the subscribed-IP set changed.
pub fn update_epg_multicast_subscription(mcast_map: &mut MulticastMap, epg: &EndpointGroup) -> bool {
    let ip = epg.multicast_group.map(|ip| ip.to_string());
    mcast_map.update(ip.as_deref(), &epg.uri)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MulticastGroupFile {
    #[serde(rename = "multicast-groups")]
    multicast_groups: Vec<String>,
}

/// Reads the multicast-group file (spec.md section 6). A missing or
/// unparsable file is treated as an empty subscription set.
pub fn read_multicast_group_file(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<MulticastGroupFile>(&text) {
            Ok(doc) => doc.multicast_groups,
            Err(e) => {
                warn!("failed to parse multicast group file {path:?}: {e}");
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!("failed to read multicast group file {path:?}: {e}");
            Vec::new()
        }
    }
}

/// Rewrites the multicast-group file with the current subscription set
/// (spec.md section 6: "rewritten on multicast-map change").
pub fn write_multicast_group_file(path: &Path, ips: &[String]) {
    let doc = MulticastGroupFile { multicast_groups: ips.to_vec() };
    match serde_json::to_string_pretty(&doc) {
        Ok(text) => {
            if let Err(e) = std::fs::write(path, text) {
                warn!("failed to persist multicast group file {path:?}: {e}");
            }
        }
        Err(e) => warn!("failed to serialize multicast group file: {e}"),
    }
}

/// Platform-config update (spec.md section 4.10): refreshes `owner_uri`'s
/// entry in the multicast map (rewriting the file if the subscribed-IP set
/// changed), re-reads the file's target IP into the flood table's tunnel
/// destination, and returns the flood domains that need their group
/// tables re-emitted as a result.
pub fn update_platform_config(
    mcast_group_file: &Path,
    mcast_map: &mut MulticastMap,
    flood: &mut FloodGroupTable,
    owner_uri: &str,
    mcast_ip: Option<&str>,
) -> Vec<String> {
    if mcast_map.update(mcast_ip, owner_uri) {
        write_multicast_group_file(mcast_group_file, &mcast_map.subscribed_ips());
    }

    let target_ip = read_multicast_group_file(mcast_group_file)
        .into_iter()
        .next()
        .and_then(|s| s.parse::<IpAddress>().ok());
    flood.set_mcast_tun_dst(target_ip);
    flood.known_domains()
}

/// Resolved (BD, FD, RD, VNID) quadruple for an EPG, produced by the ID
/// generator namespaces `"bridgeDomain"`, `"floodDomain"`, `"routingDomain"`.
#[derive(Debug, Clone, Copy)]
pub struct GroupForwardingInfo {
    pub bd_id: u32,
    pub fd_id: Option<u32>,
    pub rd_id: Option<u32>,
    pub vnid: u32,
}

/// Resolves the forwarding ids for an EPG via the shared id generator,
/// per spec.md section 4.10 step 2. Returns `None` if none of BD/RD/FD
/// could be resolved — the caller must abort the update in that case.
pub fn get_group_forwarding_info(
    idgen: &mut IdGenerator,
    epg: &EndpointGroup,
) -> Option<GroupForwardingInfo> {
    let bd_id = idgen.get_id("bridgeDomain", &epg.bridge_domain);
    let fd_id = epg.flood_domain.as_ref().map(|fd| idgen.get_id("floodDomain", fd));
    let rd_id = epg.routing_domain.as_ref().map(|rd| idgen.get_id("routingDomain", rd));

    if fd_id.is_none() && rd_id.is_none() && bd_id == opflex_common::EMPTY_STRING_ID {
        return None;
    }

    Some(GroupForwardingInfo { bd_id, fd_id, rd_id, vnid: epg.vnid })
}

/// Renders the flows owned by a single endpoint across SEC/SRC/BRIDGE/
/// ROUTE/SERVICE_MAP_DST (spec.md section 4.10, "Endpoint update").
/// Returns `None` if the endpoint no longer exists or lacks enough
/// forwarding info to render (in which case the caller should sweep with
/// an empty flow set or leave existing flows untouched, respectively).
pub struct EndpointRender {
    pub sec: Vec<FlowEntry>,
    pub src: Vec<FlowEntry>,
    pub bridge: Vec<FlowEntry>,
    pub route: Vec<FlowEntry>,
    pub service_map_dst: Vec<FlowEntry>,
    pub flood_member: Option<FloodMember>,
}

pub fn render_endpoint(
    ep: &Endpoint,
    fwd: &GroupForwardingInfo,
    port: PortNo,
    router_mac: MacAddress,
) -> EndpointRender {
    let mut sec = Vec::new();
    let mut src = Vec::new();
    let mut bridge = Vec::new();
    let mut route = Vec::new();
    let mut service_map_dst = Vec::new();

    if let Some(mac) = ep.mac {
        // Priority 20: mac-only allow.
        sec.push(FlowEntry {
            table: tables::SEC,
            priority: 20,
            cookie: Cookie(0),
            match_: Match::builder().in_port(port).eth_src(mac, None).build(),
            instructions: vec![Action::GotoTable(tables::SRC)],
        });

        // Priority 30: mac+ip allow, one per endpoint IP.
        for ip in &ep.ips {
            sec.push(FlowEntry {
                table: tables::SEC,
                priority: 30,
                cookie: Cookie(0),
                match_: Match::builder()
                    .in_port(port)
                    .eth_src(mac, None)
                    .ip_src(*ip, ip_full_prefix(ip))
                    .build(),
                instructions: vec![Action::GotoTable(tables::SRC)],
            });
        }

        // Priority 140: SRC lookup sets forwarding registers, GOTO BRIDGE.
        let mut set_regs = vec![
            Action::LoadRegister { index: regs::SRC_EPG, value: fwd.vnid as u64 },
            Action::LoadRegister { index: regs::BD, value: fwd.bd_id as u64 },
        ];
        if let Some(fd) = fwd.fd_id {
            set_regs.push(Action::LoadRegister { index: regs::FD, value: fd as u64 });
        }
        if let Some(rd) = fwd.rd_id {
            set_regs.push(Action::LoadRegister { index: regs::RD, value: rd as u64 });
        }
        set_regs.push(Action::GotoTable(tables::BRIDGE));

        src.push(FlowEntry {
            table: tables::SRC,
            priority: 140,
            cookie: Cookie(0),
            match_: Match::builder().in_port(port).eth_src(mac, None).build(),
            instructions: set_regs,
        });

        // Priority 10: BRIDGE dst-mac + BD lookup -> POL with dst regs set.
        bridge.push(FlowEntry {
            table: tables::BRIDGE,
            priority: 10,
            cookie: Cookie(0),
            match_: Match::builder()
                .eth_dst(mac, None)
                .register(regs::BD, fwd.bd_id as u64, None)
                .build(),
            instructions: vec![
                Action::LoadRegister { index: regs::DST_EPG, value: fwd.vnid as u64 },
                Action::LoadRegister { index: regs::OUT_PORT_OR_GROUP, value: port.0 as u64 },
                Action::GotoTable(tables::POL),
            ],
        });

        // Priority 500: ROUTE dst-ip + RD -> rewrite src/dst mac, dec-ttl, GOTO POL.
        if let Some(rd) = fwd.rd_id {
            for ip in &ep.ips {
                route.push(FlowEntry {
                    table: tables::ROUTE,
                    priority: 500,
                    cookie: Cookie(0),
                    match_: Match::builder()
                        .ip_dst(*ip, ip_full_prefix(ip))
                        .register(regs::RD, rd as u64, None)
                        .build(),
                    instructions: vec![
                        Action::SetEthSrc(router_mac),
                        Action::SetEthDst(mac),
                        Action::DecTtl,
                        Action::LoadRegister { index: regs::DST_EPG, value: fwd.vnid as u64 },
                        Action::LoadRegister { index: regs::OUT_PORT_OR_GROUP, value: port.0 as u64 },
                        Action::GotoTable(tables::POL),
                    ],
                });

                service_map_dst.push(FlowEntry {
                    table: tables::SERVICE_MAP_DST,
                    priority: 100,
                    cookie: Cookie(0),
                    match_: Match::builder().ip_dst(*ip, ip_full_prefix(ip)).build(),
                    instructions: vec![Action::Output(port)],
                });
            }
        }
    }

    // Promiscuous wildcard allow at priority 50.
    if ep.promiscuous {
        sec.push(FlowEntry {
            table: tables::SEC,
            priority: 50,
            cookie: Cookie(0),
            match_: Match::builder().in_port(port).build(),
            instructions: vec![Action::GotoTable(tables::SRC)],
        });
    }

    // Virtual-DHCP-server controller-punt flow at priority 60: only
    // installed when this endpoint has a DHCP config to answer from.
    if ep.dhcp.ipv4.is_some() || ep.dhcp.ipv6.is_some() {
        sec.push(FlowEntry {
            table: tables::SEC,
            priority: 60,
            cookie: DHCP_COOKIE,
            match_: Match::builder().in_port(port).eth_type(0x0800).ip_proto(17).l4_dst(67, None).build(),
            instructions: vec![Action::Controller { max_len: 128 }],
        });
    }

    // Virtual-IP controller-punt flows at priority 60.
    for vip in &ep.virtual_ips {
        let cookie = match vip.cidr.0 {
            IpAddress::V4(_) => VIP_COOKIE_V4,
            IpAddress::V6(_) => VIP_COOKIE_V6,
        };
        sec.push(FlowEntry {
            table: tables::SEC,
            priority: 60,
            cookie,
            match_: Match::builder().in_port(port).eth_src(vip.mac, None).build(),
            instructions: vec![Action::Controller { max_len: 128 }],
        });
    }

    EndpointRender {
        sec,
        src,
        bridge,
        route,
        service_map_dst,
        flood_member: Some(FloodMember { port, promiscuous: ep.promiscuous }),
    }
}

fn ip_full_prefix(ip: &IpAddress) -> u8 {
    match ip {
        IpAddress::V4(_) => 32,
        IpAddress::V6(_) => 128,
    }
}

/// Renders the static per-EPG flows (spec.md section 4.10, "Endpoint-group
/// update"): SEC floor, BRIDGE unknown-unicast fallback, subnet ARP/ND
/// responders, and the per-EPG tunnel ingress SRC flow.
pub struct EpgRender {
    pub sec: Vec<FlowEntry>,
    pub bridge: Vec<FlowEntry>,
    pub src: Vec<FlowEntry>,
    pub pol: Vec<FlowEntry>,
}

pub fn render_epg(
    epg: &EndpointGroup,
    bd: &BridgeDomain,
    fwd: &GroupForwardingInfo,
    tunnel_port: PortNo,
) -> EpgRender {
    let mut sec = Vec::new();
    let mut bridge = Vec::new();
    let mut src = Vec::new();
    let mut pol = Vec::new();

    // SEC floor: drop bare IPv4/IPv6/ARP by default (implicit, lowest
    // priority no-match miss covers this); allow DHCP request and router
    // solicitation patterns, allow uplink traffic.
    sec.push(FlowEntry {
        table: tables::SEC,
        priority: 1,
        cookie: Cookie(0),
        match_: Match::builder().eth_type(0x0806).build(),
        instructions: vec![Action::GotoTable(tables::SRC)],
    });
    sec.push(FlowEntry {
        table: tables::SEC,
        priority: 1,
        cookie: Cookie(0),
        match_: Match::builder().eth_type(0x0800).ip_proto(17).l4_dst(67, None).build(),
        instructions: vec![Action::GotoTable(tables::SRC)],
    });

    // Unknown-unicast fallback at BRIDGE priority 1.
    let fallback = match bd.unknown_flood_mode {
        UnknownFloodMode::ProxyUnicast => vec![Action::Output(tunnel_port)],
        UnknownFloodMode::Flood => vec![Action::LoadRegister { index: regs::OUT_PORT_OR_GROUP, value: 0 }],
        UnknownFloodMode::Drop => vec![],
    };
    bridge.push(FlowEntry {
        table: tables::BRIDGE,
        priority: 1,
        cookie: Cookie(0),
        match_: Match::builder().register(regs::BD, fwd.bd_id as u64, None).build(),
        instructions: fallback,
    });

    // Router-IP ARP/ND responders for each subnet.
    for subnet in &bd.subnets {
        if let Some(router_ip) = subnet.router_ip {
            bridge.push(FlowEntry {
                table: tables::BRIDGE,
                priority: 20,
                cookie: ND_COOKIE,
                match_: Match::builder()
                    .eth_type(0x0806)
                    .register(regs::BD, fwd.bd_id as u64, None)
                    .ip_dst(router_ip, ip_full_prefix(&router_ip))
                    .build(),
                instructions: vec![Action::Controller { max_len: 128 }],
            });
        }
    }

    // Per-EPG ingress-from-tunnel SRC flow at priority 149.
    src.push(FlowEntry {
        table: tables::SRC,
        priority: 149,
        cookie: Cookie(0),
        match_: Match::builder().in_port(tunnel_port).tunnel_id(epg.vnid as u64).build(),
        instructions: vec![
            Action::LoadRegister { index: regs::SRC_EPG, value: epg.vnid as u64 },
            Action::LoadRegister { index: regs::BD, value: fwd.bd_id as u64 },
            Action::GotoTable(tables::BRIDGE),
        ],
    });

    // Intra-group policy.
    if matches!(epg.intra_group_policy, crate::policy::IntraGroupPolicy::Allow) {
        pol.push(FlowEntry {
            table: tables::POL,
            priority: 100,
            cookie: Cookie(0),
            match_: Match::builder()
                .register(regs::SRC_EPG, epg.vnid as u64, None)
                .register(regs::DST_EPG, epg.vnid as u64, None)
                .build(),
            instructions: vec![Action::GotoTable(tables::STATS)],
        });
    }

    EpgRender { sec, bridge, src, pol }
}

/// Renders POL flows for a contract: the provider x consumer cross
/// product for every rule, with priority `MAX_POLICY_RULE_PRIORITY -
/// ruleIndex` (spec.md section 4.10, "Contract update").
pub fn render_contract(contract: &Contract, vnid_of: impl Fn(&str) -> Option<u32>) -> Vec<FlowEntry> {
    let mut flows = Vec::new();
    let contract_cookie = Cookie(fnv1a(&contract.uri));

    for (rule_index, rule) in contract.rules.iter().enumerate() {
        let priority = MAX_POLICY_RULE_PRIORITY.saturating_sub(rule_index as u16);

        for (provider, consumer) in itertools::iproduct!(&contract.providers, &contract.consumers) {
            if provider == consumer {
                continue;
            }
            let (Some(p_vnid), Some(c_vnid)) = (vnid_of(provider), vnid_of(consumer)) else {
                warn!("contract {}: unresolved EPG vnid for {}/{}", contract.uri, provider, consumer);
                continue;
            };

            // A bidirectional rule between EPGs that are mutually provider
            // and consumer of each other collapses to a single `in` flow;
            // otherwise both directions are emitted.
            let mutual_provider_consumer = contract.providers.contains(consumer) && contract.consumers.contains(provider);
            let pairs = match rule.direction {
                crate::policy::RuleDirection::In => vec![(c_vnid, p_vnid)],
                crate::policy::RuleDirection::Out => vec![(p_vnid, c_vnid)],
                crate::policy::RuleDirection::Bidirectional if mutual_provider_consumer => vec![(c_vnid, p_vnid)],
                crate::policy::RuleDirection::Bidirectional => vec![(c_vnid, p_vnid), (p_vnid, c_vnid)],
            };

            for (src_vnid, dst_vnid) in pairs {
                let mut builder = Match::builder()
                    .register(regs::SRC_EPG, src_vnid as u64, None)
                    .register(regs::DST_EPG, dst_vnid as u64, None);
                if let Some(eth_type) = rule.eth_type {
                    builder = builder.eth_type(eth_type);
                }
                if let Some(proto) = rule.ip_proto {
                    builder = builder.ip_proto(proto);
                }
                if let Some((lo, _hi)) = rule.l4_dst_range {
                    builder = builder.l4_dst(lo, None);
                }

                let instructions = if rule.allow {
                    vec![Action::GotoTable(tables::STATS)]
                } else {
                    vec![]
                };

                flows.push(FlowEntry {
                    table: tables::POL,
                    priority,
                    cookie: contract_cookie,
                    match_: builder.build(),
                    instructions,
                });
            }
        }
    }

    flows
}

/// Renders ROUTE/NAT_IN flows for a routing domain (spec.md section
/// 4.10, "Routing-domain update").
pub fn render_routing_domain(
    rd: &RoutingDomain,
    rd_config: Option<&RdConfig>,
    rd_id: u32,
    tunnel_port: PortNo,
    externals: &[crate::policy::L3ExternalNetwork],
    nat_vnid_of: impl Fn(&str) -> Option<u32>,
) -> (Vec<FlowEntry>, Vec<FlowEntry>) {
    let mut route = Vec::new();
    let mut nat_in = Vec::new();

    let mut internal_cidrs: Vec<(IpAddress, u8)> = rd.internal_subnets.clone();
    if let Some(cfg) = rd_config {
        internal_cidrs.extend(cfg.extra_internal_cidrs.iter().cloned());
    }

    for (cidr, prefix_len) in &internal_cidrs {
        route.push(FlowEntry {
            table: tables::ROUTE,
            priority: 300 + *prefix_len as u16,
            cookie: Cookie(0),
            match_: Match::builder()
                .ip_dst(*cidr, *prefix_len)
                .register(regs::RD, rd_id as u64, None)
                .build(),
            instructions: vec![Action::Output(tunnel_port)],
        });
    }

    for ext in externals {
        for subnet in &ext.subnets {
            let priority = 150 + subnet.cidr.1 as u16;
            let instructions = if let Some(nat_epg) = &ext.nat_epg {
                match nat_vnid_of(nat_epg) {
                    Some(vnid) => vec![
                        Action::LoadRegister { index: regs::DST_EPG, value: vnid as u64 },
                        Action::Nat { src: false, range: None },
                        Action::GotoTable(tables::POL),
                    ],
                    None => vec![Action::Output(tunnel_port)],
                }
            } else {
                vec![Action::Output(tunnel_port)]
            };

            route.push(FlowEntry {
                table: tables::ROUTE,
                priority,
                cookie: Cookie(0),
                match_: Match::builder()
                    .ip_dst(subnet.cidr.0, subnet.cidr.1)
                    .register(regs::RD, rd_id as u64, None)
                    .build(),
                instructions,
            });

            if let Some(nat_epg) = &ext.nat_epg {
                if let Some(vnid) = nat_vnid_of(nat_epg) {
                    nat_in.push(FlowEntry {
                        table: tables::NAT_IN,
                        priority,
                        cookie: Cookie(0),
                        match_: Match::builder().ip_src(subnet.cidr.0, subnet.cidr.1).build(),
                        instructions: vec![
                            Action::LoadRegister { index: regs::SRC_EPG, value: vnid as u64 },
                            Action::GotoTable(tables::POL),
                        ],
                    });
                }
            }
        }
    }

    (route, nat_in)
}

/// Deterministic small hash used to derive flow cookies from a URI; not
/// cryptographic, just stable across runs and order-independent.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Tracks which keys currently own flows/groups, for the ownership-sweep
/// rule (spec.md section 3: "deleting a key sweeps everything it owns").
pub fn object_key_for(uri_or_uuid: &str) -> ObjectKey {
    ObjectKey(fnv1a(uri_or_uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DhcpConfig, IntraGroupPolicy};
    use opflex_types::Ipv4Address;
    use std::collections::HashSet;

    fn sample_endpoint() -> Endpoint {
        Endpoint {
            uuid: "ep-1".into(),
            mac: Some(MacAddress::new([0, 1, 2, 3, 4, 5])),
            ips: vec![IpAddress::V4(Ipv4Address::new(10, 0, 0, 1))],
            interface_name: Some("veth0".into()),
            access_interface_name: None,
            epg: "epg-1".into(),
            security_groups: HashSet::new(),
            virtual_ips: vec![],
            ip_mappings: vec![],
            dhcp: DhcpConfig::default(),
            promiscuous: false,
            discovery_proxy: false,
        }
    }

    #[test]
    fn test_render_endpoint_emits_sec_src_bridge_route() {
        let ep = sample_endpoint();
        let fwd = GroupForwardingInfo { bd_id: 100, fd_id: Some(101), rd_id: Some(102), vnid: 5000 };
        let render = render_endpoint(&ep, &fwd, PortNo(3), MacAddress::new([9, 9, 9, 9, 9, 9]));

        assert!(render.sec.iter().any(|f| f.priority == 20));
        assert!(render.sec.iter().any(|f| f.priority == 30));
        assert_eq!(render.src.len(), 1);
        assert_eq!(render.src[0].priority, 140);
        assert_eq!(render.bridge.len(), 1);
        assert_eq!(render.route.len(), 1);
        assert_eq!(render.route[0].priority, 500);
    }

    #[test]
    fn test_render_endpoint_with_dhcp_config_emits_punt_flow() {
        let mut ep = sample_endpoint();
        ep.dhcp.ipv4 = Some(crate::policy::Dhcp4Config { server_ip: None, lease_seconds: None, dns_servers: vec![] });
        let fwd = GroupForwardingInfo { bd_id: 100, fd_id: Some(101), rd_id: Some(102), vnid: 5000 };
        let render = render_endpoint(&ep, &fwd, PortNo(3), MacAddress::new([9, 9, 9, 9, 9, 9]));
        let dhcp_flow = render.sec.iter().find(|f| f.cookie == DHCP_COOKIE).expect("expected DHCP punt flow");
        assert_eq!(dhcp_flow.priority, 60);
    }

    #[test]
    fn test_render_endpoint_without_mac_emits_no_forwarding_flows() {
        let mut ep = sample_endpoint();
        ep.mac = None;
        let fwd = GroupForwardingInfo { bd_id: 1, fd_id: None, rd_id: None, vnid: 1 };
        let render = render_endpoint(&ep, &fwd, PortNo(1), MacAddress::ZERO);
        assert!(render.src.is_empty());
        assert!(render.bridge.is_empty());
        assert!(render.route.is_empty());
    }

    #[test]
    fn test_flood_group_table_builds_normal_and_promiscuous_groups() {
        let mut table = FloodGroupTable::new();
        table.upsert("fd-1", "ep-1", FloodMember { port: PortNo(1), promiscuous: false });
        table.upsert("fd-1", "ep-2", FloodMember { port: PortNo(2), promiscuous: true });

        let groups = table.group_entries("fd-1", 500, Some(PortNo(99)));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id.0, 500);
        assert_eq!(groups[1].group_id.0, 500 | 0x8000_0000);
        assert_eq!(groups[0].buckets.len(), 3); // ep-1, ep-2, tunnel
        assert_eq!(groups[1].buckets.len(), 2); // ep-2 (promisc), tunnel
    }

    #[test]
    fn test_render_contract_expands_provider_consumer_cross_product() {
        let mut providers = HashSet::new();
        providers.insert("epg-a".to_string());
        let mut consumers = HashSet::new();
        consumers.insert("epg-b".to_string());

        let contract = Contract {
            uri: "contract-1".into(),
            providers,
            consumers,
            rules: vec![crate::policy::PolicyRule {
                direction: crate::policy::RuleDirection::In,
                allow: true,
                eth_type: Some(0x0800),
                ip_proto: Some(6),
                l4_src_range: None,
                l4_dst_range: Some((80, 80)),
                tcp_flags: None,
                remote_subnets: vec![],
                conntrack_mode: None,
            }],
        };

        let vnids: HashMap<&str, u32> = [("epg-a", 100), ("epg-b", 200)].into_iter().collect();
        let flows = render_contract(&contract, |uri| vnids.get(uri).copied());
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].priority, MAX_POLICY_RULE_PRIORITY);
    }

    #[test]
    fn test_render_contract_priority_decreases_with_rule_index() {
        let mut providers = HashSet::new();
        providers.insert("a".to_string());
        let mut consumers = HashSet::new();
        consumers.insert("b".to_string());
        let rule = crate::policy::PolicyRule {
            direction: crate::policy::RuleDirection::Out,
            allow: true,
            eth_type: None,
            ip_proto: None,
            l4_src_range: None,
            l4_dst_range: None,
            tcp_flags: None,
            remote_subnets: vec![],
            conntrack_mode: None,
        };
        let contract = Contract { uri: "c".into(), providers, consumers, rules: vec![rule.clone(), rule] };
        let vnids: HashMap<&str, u32> = [("a", 1), ("b", 2)].into_iter().collect();
        let flows = render_contract(&contract, |uri| vnids.get(uri).copied());
        assert_eq!(flows[0].priority, MAX_POLICY_RULE_PRIORITY);
        assert_eq!(flows[1].priority, MAX_POLICY_RULE_PRIORITY - 1);
    }

    #[test]
    fn test_epg_intra_group_allow_emits_pol_flow() {
        let epg = EndpointGroup {
            uri: "epg-1".into(),
            vnid: 42,
            bridge_domain: "bd-1".into(),
            flood_domain: Some("fd-1".into()),
            routing_domain: Some("rd-1".into()),
            intra_group_policy: IntraGroupPolicy::Allow,
            multicast_group: None,
        };
        let bd = BridgeDomain {
            uri: "bd-1".into(),
            routing_enabled: true,
            unknown_flood_mode: UnknownFloodMode::ProxyUnicast,
            arp_nd_mode: ArpNdMode::Unicast,
            router_mac: Some(MacAddress::ZERO),
            subnets: vec![],
        };
        let fwd = GroupForwardingInfo { bd_id: 10, fd_id: Some(11), rd_id: Some(12), vnid: 42 };
        let render = render_epg(&epg, &bd, &fwd, PortNo(50));
        assert_eq!(render.pol.len(), 1);
        assert_eq!(render.bridge[0].priority, 1);
    }

    fn bidirectional_rule() -> crate::policy::PolicyRule {
        crate::policy::PolicyRule {
            direction: crate::policy::RuleDirection::Bidirectional,
            allow: true,
            eth_type: None,
            ip_proto: None,
            l4_src_range: None,
            l4_dst_range: None,
            tcp_flags: None,
            remote_subnets: vec![],
            conntrack_mode: None,
        }
    }

    #[test]
    fn test_bidirectional_rule_collapses_to_in_for_mutual_provider_consumer() {
        // epg-a and epg-b are each other's provider and consumer, so a
        // bidirectional rule must only emit the `in` direction once.
        let mut providers = HashSet::new();
        providers.insert("epg-a".to_string());
        providers.insert("epg-b".to_string());
        let mut consumers = HashSet::new();
        consumers.insert("epg-a".to_string());
        consumers.insert("epg-b".to_string());

        let contract = Contract { uri: "c".into(), providers, consumers, rules: vec![bidirectional_rule()] };
        let vnids: HashMap<&str, u32> = [("epg-a", 1), ("epg-b", 2)].into_iter().collect();
        let flows = render_contract(&contract, |uri| vnids.get(uri).copied());

        // iproduct over providers x consumers yields (a,b) and (b,a); each
        // mutual pair collapses to one `in` flow instead of two.
        assert_eq!(flows.len(), 2);
    }

    #[test]
    fn test_bidirectional_rule_emits_both_directions_when_not_mutual() {
        let mut providers = HashSet::new();
        providers.insert("epg-a".to_string());
        let mut consumers = HashSet::new();
        consumers.insert("epg-b".to_string());

        let contract = Contract { uri: "c".into(), providers, consumers, rules: vec![bidirectional_rule()] };
        let vnids: HashMap<&str, u32> = [("epg-a", 1), ("epg-b", 2)].into_iter().collect();
        let flows = render_contract(&contract, |uri| vnids.get(uri).copied());

        assert_eq!(flows.len(), 2, "non-mutual bidirectional rule still needs both directions");
    }

    #[test]
    fn test_multicast_map_refcounts_owners_and_reports_change() {
        let mut map = MulticastMap::new();
        assert!(map.update(Some("239.1.1.1"), "epg-a"));
        assert!(!map.update(Some("239.1.1.1"), "epg-b"), "second owner of the same IP isn't a new subscription");
        assert_eq!(map.subscribed_ips(), vec!["239.1.1.1".to_string()]);

        assert!(!map.remove_owner("epg-a"), "IP still has epg-b as an owner");
        assert!(map.remove_owner("epg-b"), "last owner leaving drops the IP");
        assert!(map.subscribed_ips().is_empty());
    }

    #[test]
    fn test_multicast_group_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcast-groups.json");

        assert!(read_multicast_group_file(&path).is_empty(), "missing file reads as empty");

        write_multicast_group_file(&path, &["239.1.1.1".to_string(), "239.1.1.2".to_string()]);
        let ips = read_multicast_group_file(&path);
        assert_eq!(ips, vec!["239.1.1.1".to_string(), "239.1.1.2".to_string()]);
    }

    #[test]
    fn test_update_platform_config_threads_target_ip_into_tunnel_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcast-groups.json");
        let mut mcast_map = MulticastMap::new();
        let mut flood = FloodGroupTable::new();
        flood.upsert("fd-1", "ep-1", FloodMember { port: PortNo(1), promiscuous: false });

        let domains = update_platform_config(&path, &mut mcast_map, &mut flood, "platform-config", Some("239.5.5.5"));
        assert_eq!(domains, vec!["fd-1".to_string()]);
        assert_eq!(flood.mcast_tun_dst(), Some("239.5.5.5".parse().unwrap()));

        let groups = flood.group_entries("fd-1", 10, Some(PortNo(99)));
        let tunnel_bucket = groups[0].buckets.last().unwrap();
        assert!(tunnel_bucket.actions.iter().any(|a| matches!(a, Action::SetIpDst(_))));
    }

    #[test]
    fn test_update_epg_multicast_subscription_tracks_epg_owned_ip() {
        let mut map = MulticastMap::new();
        let mut epg = EndpointGroup {
            uri: "epg-1".into(),
            vnid: 1,
            bridge_domain: "bd-1".into(),
            flood_domain: None,
            routing_domain: None,
            intra_group_policy: IntraGroupPolicy::Allow,
            multicast_group: Some("239.2.2.2".parse().unwrap()),
        };
        assert!(update_epg_multicast_subscription(&mut map, &epg));
        assert_eq!(map.subscribed_ips(), vec!["239.2.2.2".to_string()]);

        epg.multicast_group = None;
        assert!(update_epg_multicast_subscription(&mut map, &epg));
        assert!(map.subscribed_ips().is_empty());
    }
}
