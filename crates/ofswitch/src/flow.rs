//! Flow Encoder (C2): builder API for OpenFlow matches, actions and
//! instructions, plus the FlowEntry/FlowEdit/GroupEntry core entities
//! (spec.md section 3/4.2).
//!
//! Match fields are stored in a `BTreeMap` keyed by a field discriminant so
//! that two builders constructed with equivalent calls, in any call order,
//! produce an identical `Match`. This determinism is required for
//! `TableState`'s diffing to be correct: diffing compares matches by value,
//! not by construction history.

use std::collections::BTreeMap;

use opflex_types::{IpAddress, MacAddress};

use crate::types::{Cookie, GroupId, PortNo, TableId};

/// A single match field, ordered so iteration over a `Match` is
/// deterministic regardless of the order fields were added in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchField {
    EthType,
    EthSrc,
    EthDst,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    IpProto,
    L4Src,
    L4Dst,
    TcpFlags,
    VlanId,
    TunnelId,
    Register(u8),
    ConntrackState,
    ConntrackMark,
    ConntrackLabel,
    Metadata,
    InPort,
}

/// The value (and optional mask) carried by a match field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    U16 { value: u16, mask: Option<u16> },
    U32 { value: u32, mask: Option<u32> },
    U64 { value: u64, mask: Option<u64> },
    U128 { value: u128, mask: Option<u128> },
    Mac { value: MacAddress, mask: Option<MacAddress> },
    Ip { value: IpAddress, prefix_len: u8 },
    Port(PortNo),
}

/// A complete, order-independent match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Match {
    fields: BTreeMap<MatchField, MatchValue>,
}

impl Match {
    pub fn builder() -> MatchBuilder {
        MatchBuilder::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&MatchField, &MatchValue)> {
        self.fields.iter()
    }

    pub fn get(&self, field: &MatchField) -> Option<&MatchValue> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fluent builder for [`Match`]. Calling the same setter twice overwrites
/// the previous value rather than erroring, matching the idempotent-apply
/// style of the rest of the render pipeline.
#[derive(Debug, Clone, Default)]
pub struct MatchBuilder {
    fields: BTreeMap<MatchField, MatchValue>,
}

impl MatchBuilder {
    pub fn in_port(mut self, port: PortNo) -> Self {
        self.fields.insert(MatchField::InPort, MatchValue::Port(port));
        self
    }

    pub fn eth_type(mut self, ether_type: u16) -> Self {
        self.fields.insert(
            MatchField::EthType,
            MatchValue::U16 { value: ether_type, mask: None },
        );
        self
    }

    pub fn eth_src(mut self, mac: MacAddress, mask: Option<MacAddress>) -> Self {
        self.fields
            .insert(MatchField::EthSrc, MatchValue::Mac { value: mac, mask });
        self
    }

    pub fn eth_dst(mut self, mac: MacAddress, mask: Option<MacAddress>) -> Self {
        self.fields
            .insert(MatchField::EthDst, MatchValue::Mac { value: mac, mask });
        self
    }

    pub fn ip_src(mut self, addr: IpAddress, prefix_len: u8) -> Self {
        self.fields
            .insert(MatchField::Ipv4Src, MatchValue::Ip { value: addr, prefix_len });
        self
    }

    pub fn ip_dst(mut self, addr: IpAddress, prefix_len: u8) -> Self {
        self.fields
            .insert(MatchField::Ipv4Dst, MatchValue::Ip { value: addr, prefix_len });
        self
    }

    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.fields.insert(
            MatchField::IpProto,
            MatchValue::U16 { value: proto as u16, mask: None },
        );
        self
    }

    pub fn l4_src(mut self, port: u16, mask: Option<u16>) -> Self {
        self.fields
            .insert(MatchField::L4Src, MatchValue::U16 { value: port, mask });
        self
    }

    pub fn l4_dst(mut self, port: u16, mask: Option<u16>) -> Self {
        self.fields
            .insert(MatchField::L4Dst, MatchValue::U16 { value: port, mask });
        self
    }

    pub fn tcp_flags(mut self, flags: u16, mask: Option<u16>) -> Self {
        self.fields
            .insert(MatchField::TcpFlags, MatchValue::U16 { value: flags, mask });
        self
    }

    pub fn vlan_id(mut self, vlan: u16) -> Self {
        self.fields
            .insert(MatchField::VlanId, MatchValue::U16 { value: vlan, mask: None });
        self
    }

    pub fn tunnel_id(mut self, id: u64) -> Self {
        self.fields
            .insert(MatchField::TunnelId, MatchValue::U64 { value: id, mask: None });
        self
    }

    pub fn register(mut self, index: u8, value: u64, mask: Option<u64>) -> Self {
        self.fields
            .insert(MatchField::Register(index), MatchValue::U64 { value, mask });
        self
    }

    pub fn conntrack_state(mut self, state: u32, mask: u32) -> Self {
        self.fields.insert(
            MatchField::ConntrackState,
            MatchValue::U32 { value: state, mask: Some(mask) },
        );
        self
    }

    pub fn conntrack_mark(mut self, mark: u32) -> Self {
        self.fields.insert(
            MatchField::ConntrackMark,
            MatchValue::U32 { value: mark, mask: None },
        );
        self
    }

    pub fn conntrack_label(mut self, label: u128) -> Self {
        self.fields.insert(
            MatchField::ConntrackLabel,
            MatchValue::U128 { value: label, mask: None },
        );
        self
    }

    pub fn metadata(mut self, value: u64, mask: Option<u64>) -> Self {
        self.fields
            .insert(MatchField::Metadata, MatchValue::U64 { value, mask });
        self
    }

    pub fn build(self) -> Match {
        Match { fields: self.fields }
    }
}

/// A single OpenFlow action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LoadRegister { index: u8, value: u64 },
    CopyRegister { src: u8, dst: u8 },
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    SetIpSrc(IpAddress),
    SetIpDst(IpAddress),
    DecTtl,
    PushVlan(u16),
    PopVlan,
    Output(PortNo),
    OutputRegister(u8),
    Group(GroupId),
    Controller { max_len: u16 },
    GotoTable(TableId),
    Resubmit { table: Option<TableId> },
    Conntrack { commit: bool, zone: Option<u16>, actions: Vec<Action> },
    Nat { src: bool, range: Option<(IpAddress, IpAddress)> },
    Multipath { fields_hash: u32, n_links: u16, register: u8 },
    MacLearn,
}

/// A group bucket within a [`GroupEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBucket {
    pub bucket_id: u32,
    pub weight: u16,
    pub watch_port: Option<PortNo>,
    pub actions: Vec<Action>,
}

/// Group table type (OpenFlow OFPGT_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    All,
    Select,
    Indirect,
    FastFailover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub group_id: GroupId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
}

/// A flow table entry. Two entries compare equal (for table-state purposes)
/// iff `(table, priority, match)` match; `cookie`/`instructions` are
/// updates to an existing identity, not a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub table: TableId,
    pub priority: u16,
    pub cookie: Cookie,
    pub match_: Match,
    pub instructions: Vec<Action>,
}

impl FlowEntry {
    pub fn identity_key(&self) -> (TableId, u16, &Match) {
        (self.table, self.priority, &self.match_)
    }
}

/// An edit to apply to the switch's flow table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEdit {
    Add(FlowEntry),
    Mod(FlowEntry),
    Del(FlowEntry),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_match_builder_order_independent() {
        let a = Match::builder().eth_type(0x0800).ip_proto(6).build();
        let b = Match::builder().ip_proto(6).eth_type(0x0800).build();
        assert_eq!(a, b);
    }

    #[test]
    fn test_match_builder_overwrite() {
        let m = Match::builder().vlan_id(10).vlan_id(20).build();
        assert_eq!(
            m.get(&MatchField::VlanId),
            Some(&MatchValue::U16 { value: 20, mask: None })
        );
    }

    #[test]
    fn test_flow_entry_identity_ignores_cookie() {
        let m = Match::builder().eth_type(0x0806).build();
        let a = FlowEntry {
            table: TableId(0),
            priority: 100,
            cookie: Cookie(1),
            match_: m.clone(),
            instructions: vec![Action::Output(PortNo(1))],
        };
        let b = FlowEntry {
            table: TableId(0),
            priority: 100,
            cookie: Cookie(2),
            match_: m,
            instructions: vec![Action::Output(PortNo(2))],
        };
        assert_eq!(a.identity_key(), b.identity_key());
        assert_ne!(a.instructions, b.instructions);
    }
}
