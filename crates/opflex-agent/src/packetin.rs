//! Packet-In Handler (C14): dispatches switch-punted packets by flow
//! cookie, either synthesizing a reactive flow (MAC learning) or handing
//! off to a reply builder for ARP/ND/DHCP/VIP punts (spec.md section
//! 4.14).

use std::collections::HashSet;

use ofswitch::{Action, Cookie, FlowEntry, Match, PortNo, TableId};
use opflex_types::MacAddress;

use crate::intflow::{tables, DHCP_COOKIE, LEARN_COOKIE, ND_COOKIE, VIP_COOKIE_V4, VIP_COOKIE_V6};

/// A decoded packet-in, already stripped of its switch framing.
pub struct PacketIn {
    pub cookie: Cookie,
    pub in_port: PortNo,
    pub src_mac: MacAddress,
    pub buffer_id: Option<u32>,
}

/// What the handler decided to do with one packet-in.
pub enum PacketInAction {
    /// Program a reactive BRIDGE flow for the learned source, then
    /// packet-out the original buffer so the triggering frame isn't lost.
    Learn { flow: FlowEntry, replay_buffer_id: Option<u32> },
    /// A synthesized reply is ready to packet-out.
    Reply { data: Vec<u8>, out_port: PortNo },
    /// Cookie matched no reactive dispatch; drop silently.
    Unhandled,
}

/// Builds the wire bytes for a controller-synthesized reply. The handler
/// itself holds no packet codec — that's a separate concern — it only
/// decides which kind of reply is due and when.
pub trait ReplyBuilder {
    fn build_nd_reply(&self, pkt: &PacketIn) -> Option<Vec<u8>>;
    fn build_dhcp_reply(&self, pkt: &PacketIn) -> Option<Vec<u8>>;
    fn build_vip_reply(&self, pkt: &PacketIn) -> Option<Vec<u8>>;
}

/// Dispatches packet-ins and tracks which switch-observed reactive flows
/// should survive C9's sync diff (`reconcileReactiveFlow` opt-out).
#[derive(Default)]
pub struct PacketInHandler {
    reconciled: HashSet<(TableId, u16)>,
}

impl PacketInHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a switch-side learned flow as intentional: C9's reconciliation
    /// sync must not delete it even though no manager's desired-state list
    /// produced it directly.
    pub fn reconcile_reactive_flow(&mut self, flow: &FlowEntry) {
        self.reconciled.insert((flow.table, flow.priority));
    }

    pub fn is_reconciled(&self, table: TableId, priority: u16) -> bool {
        self.reconciled.contains(&(table, priority))
    }

    pub fn dispatch(&self, pkt: &PacketIn, replies: &dyn ReplyBuilder) -> PacketInAction {
        if pkt.cookie == LEARN_COOKIE {
            let flow = FlowEntry {
                table: tables::BRIDGE,
                priority: 101,
                cookie: LEARN_COOKIE,
                match_: Match::builder().eth_dst(pkt.src_mac, None).build(),
                instructions: vec![Action::Output(pkt.in_port)],
            };
            return PacketInAction::Learn { flow, replay_buffer_id: pkt.buffer_id };
        }

        if pkt.cookie == ND_COOKIE {
            if let Some(data) = replies.build_nd_reply(pkt) {
                return PacketInAction::Reply { data, out_port: pkt.in_port };
            }
        }
        if pkt.cookie == DHCP_COOKIE {
            if let Some(data) = replies.build_dhcp_reply(pkt) {
                return PacketInAction::Reply { data, out_port: pkt.in_port };
            }
        }
        if pkt.cookie == VIP_COOKIE_V4 || pkt.cookie == VIP_COOKIE_V6 {
            if let Some(data) = replies.build_vip_reply(pkt) {
                return PacketInAction::Reply { data, out_port: pkt.in_port };
            }
        }

        PacketInAction::Unhandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReplies {
        nd: Option<Vec<u8>>,
        dhcp: Option<Vec<u8>>,
        vip: Option<Vec<u8>>,
    }

    impl ReplyBuilder for StubReplies {
        fn build_nd_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
            self.nd.clone()
        }
        fn build_dhcp_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
            self.dhcp.clone()
        }
        fn build_vip_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
            self.vip.clone()
        }
    }

    fn pkt(cookie: Cookie) -> PacketIn {
        PacketIn { cookie, in_port: PortNo(7), src_mac: MacAddress::new([1, 2, 3, 4, 5, 6]), buffer_id: Some(42) }
    }

    #[test]
    fn test_learn_cookie_synthesizes_bridge_flow() {
        let handler = PacketInHandler::new();
        let replies = StubReplies { nd: None, dhcp: None, vip: None };
        match handler.dispatch(&pkt(LEARN_COOKIE), &replies) {
            PacketInAction::Learn { flow, replay_buffer_id } => {
                assert_eq!(flow.table, tables::BRIDGE);
                assert_eq!(flow.priority, 101);
                assert_eq!(replay_buffer_id, Some(42));
            }
            _ => panic!("expected Learn"),
        }
    }

    #[test]
    fn test_nd_cookie_dispatches_to_reply_builder() {
        let handler = PacketInHandler::new();
        let replies = StubReplies { nd: Some(vec![1, 2, 3]), dhcp: None, vip: None };
        match handler.dispatch(&pkt(ND_COOKIE), &replies) {
            PacketInAction::Reply { data, .. } => assert_eq!(data, vec![1, 2, 3]),
            _ => panic!("expected Reply"),
        }
    }

    #[test]
    fn test_unknown_cookie_is_unhandled() {
        let handler = PacketInHandler::new();
        let replies = StubReplies { nd: None, dhcp: None, vip: None };
        assert!(matches!(handler.dispatch(&pkt(Cookie(0xdead_beef)), &replies), PacketInAction::Unhandled));
    }

    #[test]
    fn test_reconcile_reactive_flow_marks_survivor() {
        let mut handler = PacketInHandler::new();
        let flow = FlowEntry {
            table: tables::BRIDGE,
            priority: 101,
            cookie: LEARN_COOKIE,
            match_: Match::builder().build(),
            instructions: vec![],
        };
        assert!(!handler.is_reconciled(tables::BRIDGE, 101));
        handler.reconcile_reactive_flow(&flow);
        assert!(handler.is_reconciled(tables::BRIDGE, 101));
    }
}
