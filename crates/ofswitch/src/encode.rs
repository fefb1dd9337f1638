//! Wire encoding boundary for flow/group edits.
//!
//! `encode_flow_entry`/`encode_group_entry` turn the in-memory entities from
//! [`crate::flow`] into the byte strings actually written to the wire.
//! Encoding is pure and total: the same `FlowEntry` always encodes to the
//! same bytes regardless of how the `Match`/instruction list was built,
//! which is what makes `TableState`'s diffing sound (spec.md section 4.2's
//! determinism contract).

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use opflex_types::IpAddress;

use crate::error::{OfError, OfResult};
use crate::flow::{Action, FlowEntry, GroupEntry, GroupType, Match, MatchField, MatchValue};

fn write_match(buf: &mut Vec<u8>, m: &Match) -> OfResult<()> {
    for (field, value) in m.fields() {
        encode_match_field(buf, field)?;
        encode_match_value(buf, value)?;
    }
    Ok(())
}

fn encode_match_field(buf: &mut Vec<u8>, field: &MatchField) -> OfResult<()> {
    let tag: u8 = match field {
        MatchField::InPort => 0,
        MatchField::EthType => 1,
        MatchField::EthSrc => 2,
        MatchField::EthDst => 3,
        MatchField::Ipv4Src => 4,
        MatchField::Ipv4Dst => 5,
        MatchField::Ipv6Src => 6,
        MatchField::Ipv6Dst => 7,
        MatchField::IpProto => 8,
        MatchField::L4Src => 9,
        MatchField::L4Dst => 10,
        MatchField::TcpFlags => 11,
        MatchField::VlanId => 12,
        MatchField::TunnelId => 13,
        MatchField::Register(_) => 14,
        MatchField::ConntrackState => 15,
        MatchField::ConntrackMark => 16,
        MatchField::ConntrackLabel => 17,
        MatchField::Metadata => 18,
    };
    buf.push(tag);
    if let MatchField::Register(index) = field {
        buf.push(*index);
    }
    Ok(())
}

fn encode_match_value(buf: &mut Vec<u8>, value: &MatchValue) -> OfResult<()> {
    match value {
        MatchValue::U16 { value, mask } => {
            buf.write_u16::<BigEndian>(*value)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            write_opt_mask_u16(buf, *mask)
        }
        MatchValue::U32 { value, mask } => {
            buf.write_u32::<BigEndian>(*value)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            write_opt_mask_u32(buf, *mask)
        }
        MatchValue::U64 { value, mask } => {
            buf.write_u64::<BigEndian>(*value)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            write_opt_mask_u64(buf, *mask)
        }
        MatchValue::U128 { value, mask } => {
            buf.write_u128::<BigEndian>(*value)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            if let Some(m) = mask {
                buf.push(1);
                buf.write_u128::<BigEndian>(*m)
                    .map_err(|e| OfError::encoding(e.to_string()))?;
            } else {
                buf.push(0);
            }
            Ok(())
        }
        MatchValue::Mac { value, mask } => {
            buf.write_all(&value.octets())
                .map_err(|e| OfError::encoding(e.to_string()))?;
            if let Some(m) = mask {
                buf.push(1);
                buf.write_all(&m.octets())
                    .map_err(|e| OfError::encoding(e.to_string()))?;
            } else {
                buf.push(0);
            }
            Ok(())
        }
        MatchValue::Ip { value, prefix_len } => {
            match value {
                IpAddress::V4(v4) => buf.write_all(&v4.octets()),
                IpAddress::V6(v6) => buf.write_all(&v6.octets()),
            }
            .map_err(|e| OfError::encoding(e.to_string()))?;
            buf.push(*prefix_len);
            Ok(())
        }
        MatchValue::Port(port) => buf
            .write_u32::<BigEndian>(port.0)
            .map_err(|e| OfError::encoding(e.to_string())),
    }
}

fn write_opt_mask_u16(buf: &mut Vec<u8>, mask: Option<u16>) -> OfResult<()> {
    match mask {
        Some(m) => {
            buf.push(1);
            buf.write_u16::<BigEndian>(m)
                .map_err(|e| OfError::encoding(e.to_string()))
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn write_opt_mask_u32(buf: &mut Vec<u8>, mask: Option<u32>) -> OfResult<()> {
    match mask {
        Some(m) => {
            buf.push(1);
            buf.write_u32::<BigEndian>(m)
                .map_err(|e| OfError::encoding(e.to_string()))
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn write_opt_mask_u64(buf: &mut Vec<u8>, mask: Option<u64>) -> OfResult<()> {
    match mask {
        Some(m) => {
            buf.push(1);
            buf.write_u64::<BigEndian>(m)
                .map_err(|e| OfError::encoding(e.to_string()))
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn encode_action(buf: &mut Vec<u8>, action: &Action) -> OfResult<()> {
    match action {
        Action::LoadRegister { index, value } => {
            buf.push(0);
            buf.push(*index);
            buf.write_u64::<BigEndian>(*value)
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::CopyRegister { src, dst } => {
            buf.push(1);
            buf.push(*src);
            buf.push(*dst);
        }
        Action::SetEthSrc(mac) => {
            buf.push(2);
            buf.write_all(&mac.octets())
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::SetEthDst(mac) => {
            buf.push(3);
            buf.write_all(&mac.octets())
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::SetIpSrc(addr) | Action::SetIpDst(addr) => {
            buf.push(if matches!(action, Action::SetIpSrc(_)) { 4 } else { 5 });
            match addr {
                IpAddress::V4(v4) => buf.write_all(&v4.octets()),
                IpAddress::V6(v6) => buf.write_all(&v6.octets()),
            }
            .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::DecTtl => buf.push(6),
        Action::PushVlan(vlan) => {
            buf.push(7);
            buf.write_u16::<BigEndian>(*vlan)
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::PopVlan => buf.push(8),
        Action::Output(port) => {
            buf.push(9);
            buf.write_u32::<BigEndian>(port.0)
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::OutputRegister(index) => {
            buf.push(10);
            buf.push(*index);
        }
        Action::Group(gid) => {
            buf.push(11);
            buf.write_u32::<BigEndian>(gid.0)
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::Controller { max_len } => {
            buf.push(12);
            buf.write_u16::<BigEndian>(*max_len)
                .map_err(|e| OfError::encoding(e.to_string()))?;
        }
        Action::GotoTable(table) => {
            buf.push(13);
            buf.push(table.0);
        }
        Action::Resubmit { table } => {
            buf.push(14);
            buf.push(table.map(|t| t.0).unwrap_or(0xff));
        }
        Action::Conntrack { commit, zone, actions } => {
            buf.push(15);
            buf.push(u8::from(*commit));
            buf.write_u16::<BigEndian>(zone.unwrap_or(0))
                .map_err(|e| OfError::encoding(e.to_string()))?;
            buf.write_u32::<BigEndian>(actions.len() as u32)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            for nested in actions {
                encode_action(buf, nested)?;
            }
        }
        Action::Nat { src, range } => {
            buf.push(16);
            buf.push(u8::from(*src));
            if let Some((lo, hi)) = range {
                buf.push(1);
                for ip in [lo, hi] {
                    match ip {
                        IpAddress::V4(v4) => buf.write_all(&v4.octets()),
                        IpAddress::V6(v6) => buf.write_all(&v6.octets()),
                    }
                    .map_err(|e| OfError::encoding(e.to_string()))?;
                }
            } else {
                buf.push(0);
            }
        }
        Action::Multipath { fields_hash, n_links, register } => {
            buf.push(17);
            buf.write_u32::<BigEndian>(*fields_hash)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            buf.write_u16::<BigEndian>(*n_links)
                .map_err(|e| OfError::encoding(e.to_string()))?;
            buf.push(*register);
        }
        Action::MacLearn => buf.push(18),
    }
    Ok(())
}

/// Encodes a flow entry deterministically. The cookie is included so a
/// MOD that only changes the cookie still produces different bytes.
pub fn encode_flow_entry(entry: &FlowEntry) -> OfResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(entry.table.0);
    buf.write_u16::<BigEndian>(entry.priority)
        .map_err(|e| OfError::encoding(e.to_string()))?;
    buf.write_u64::<BigEndian>(entry.cookie.0)
        .map_err(|e| OfError::encoding(e.to_string()))?;
    write_match(&mut buf, &entry.match_)?;
    buf.write_u32::<BigEndian>(entry.instructions.len() as u32)
        .map_err(|e| OfError::encoding(e.to_string()))?;
    for action in &entry.instructions {
        encode_action(&mut buf, action)?;
    }
    Ok(buf)
}

pub fn encode_group_entry(entry: &GroupEntry) -> OfResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(entry.group_id.0)
        .map_err(|e| OfError::encoding(e.to_string()))?;
    buf.push(match entry.group_type {
        GroupType::All => 0,
        GroupType::Select => 1,
        GroupType::Indirect => 2,
        GroupType::FastFailover => 3,
    });
    buf.write_u32::<BigEndian>(entry.buckets.len() as u32)
        .map_err(|e| OfError::encoding(e.to_string()))?;
    for bucket in &entry.buckets {
        buf.write_u32::<BigEndian>(bucket.bucket_id)
            .map_err(|e| OfError::encoding(e.to_string()))?;
        buf.write_u16::<BigEndian>(bucket.weight)
            .map_err(|e| OfError::encoding(e.to_string()))?;
        buf.write_u32::<BigEndian>(bucket.watch_port.map(|p| p.0).unwrap_or(u32::MAX))
            .map_err(|e| OfError::encoding(e.to_string()))?;
        buf.write_u32::<BigEndian>(bucket.actions.len() as u32)
            .map_err(|e| OfError::encoding(e.to_string()))?;
        for action in &bucket.actions {
            encode_action(&mut buf, action)?;
        }
    }
    Ok(buf)
}
