//! Access Flow Manager (C11): four-table pipeline (GROUP_MAP ->
//! SEC_GROUP_IN -> SEC_GROUP_OUT -> OUT) translating endpoints and
//! security-group sets into connection-tracked flows (spec.md section
//! 4.11).

use ofswitch::{Action, Cookie, FlowEntry, Match, PortNo, TableId};
use opflex_types::IpAddress;

use crate::policy::{Endpoint, PolicyRule, RuleDirection};

pub mod tables {
    use ofswitch::TableId;

    pub const GROUP_MAP: TableId = TableId(0);
    pub const SEC_GROUP_IN: TableId = TableId(1);
    pub const SEC_GROUP_OUT: TableId = TableId(2);
    pub const OUT: TableId = TableId(3);
}

/// A security-group *set* key: the concatenation of member URIs, sorted,
/// so that two endpoints with the same effective set share a render
/// (spec.md section 4.11: "the set itself is a key").
pub fn security_group_set_key(sg_uris: &std::collections::HashSet<String>) -> String {
    let mut sorted: Vec<&String> = sg_uris.iter().collect();
    sorted.sort();
    sorted.into_iter().cloned().collect::<Vec<_>>().join(",")
}

pub struct AccessRender {
    pub group_map: Vec<FlowEntry>,
    pub sec_group_in: Vec<FlowEntry>,
    pub sec_group_out: Vec<FlowEntry>,
    pub out: Vec<FlowEntry>,
}

/// Renders one endpoint's access-side flows: GROUP_MAP classification,
/// conntrack-commit flows in both directions, one flow per rule (direction
/// x remote-subnet x L4-range x TCP-flag combination), and OUT dispatch
/// to the access interface.
pub fn render_endpoint_access(
    ep: &Endpoint,
    epg_vnid: u32,
    zone: u16,
    rules: &[PolicyRule],
    access_port: PortNo,
) -> AccessRender {
    let mut group_map = Vec::new();
    let mut sec_group_in = Vec::new();
    let mut sec_group_out = Vec::new();
    let mut out = Vec::new();

    if let Some(mac) = ep.mac {
        group_map.push(FlowEntry {
            table: tables::GROUP_MAP,
            priority: 100,
            cookie: Cookie(0),
            match_: Match::builder().in_port(access_port).eth_src(mac, None).build(),
            instructions: vec![
                Action::LoadRegister { index: 0, value: epg_vnid as u64 },
                Action::GotoTable(tables::SEC_GROUP_IN),
            ],
        });
    }

    // Two conntrack-commit flows: egress from the endpoint (IN table) and
    // ingress to the endpoint (OUT table), both opening state in `zone`.
    sec_group_in.push(FlowEntry {
        table: tables::SEC_GROUP_IN,
        priority: 10,
        cookie: Cookie(0),
        match_: Match::builder().in_port(access_port).build(),
        instructions: vec![Action::Conntrack {
            commit: true,
            zone: Some(zone),
            actions: vec![Action::GotoTable(tables::SEC_GROUP_OUT)],
        }],
    });
    sec_group_out.push(FlowEntry {
        table: tables::SEC_GROUP_OUT,
        priority: 10,
        cookie: Cookie(0),
        match_: Match::builder().conntrack_state(0x20, 0x20).build(), // +est
        instructions: vec![Action::Conntrack {
            commit: true,
            zone: Some(zone),
            actions: vec![Action::GotoTable(tables::OUT)],
        }],
    });

    for (idx, rule) in rules.iter().enumerate() {
        let priority = 1000u16.saturating_sub(idx as u16);
        let table = match rule.direction {
            RuleDirection::In | RuleDirection::Bidirectional => tables::SEC_GROUP_IN,
            RuleDirection::Out => tables::SEC_GROUP_OUT,
        };

        let remote_subnets: Vec<Option<(IpAddress, u8)>> = if rule.remote_subnets.is_empty() {
            vec![None]
        } else {
            rule.remote_subnets.iter().map(|s| Some(*s)).collect()
        };

        for remote in remote_subnets {
            let mut builder = Match::builder().in_port(access_port);
            if let Some(eth_type) = rule.eth_type {
                builder = builder.eth_type(eth_type);
            }
            if let Some(proto) = rule.ip_proto {
                builder = builder.ip_proto(proto);
            }
            if let Some((lo, _hi)) = rule.l4_dst_range {
                builder = builder.l4_dst(lo, None);
            }
            if let Some((flags, mask)) = rule.tcp_flags {
                builder = builder.tcp_flags(flags, Some(mask));
            }
            if let Some((ip, prefix)) = remote {
                builder = builder.ip_dst(ip, prefix);
            }

            let instructions = if rule.allow {
                vec![Action::GotoTable(tables::OUT)]
            } else {
                vec![]
            };

            let entry_table = table;
            let flows = match entry_table {
                t if t == tables::SEC_GROUP_IN => &mut sec_group_in,
                _ => &mut sec_group_out,
            };
            flows.push(FlowEntry {
                table: entry_table,
                priority,
                cookie: Cookie(0),
                match_: builder.build(),
                instructions,
            });
        }
    }

    if let Some(access_if) = &ep.access_interface_name {
        let _ = access_if;
        out.push(FlowEntry {
            table: tables::OUT,
            priority: 10,
            cookie: Cookie(0),
            match_: Match::builder().build(),
            instructions: vec![Action::Output(access_port)],
        });
    }

    AccessRender { group_map, sec_group_in, sec_group_out, out }
}
