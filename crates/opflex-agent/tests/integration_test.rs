//! End-to-end tests wiring policy objects through the flow renderers,
//! the switch manager and the dispatch loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ofswitch::{ObjectKey, SwitchConnection, TableId};
use opflex_agent::conntrack::ConntrackZoneManager;
use opflex_agent::daemon::{AgentDaemon, AgentEvent};
use opflex_agent::intflow::{
    get_group_forwarding_info, render_endpoint, render_epg, tables, GroupForwardingInfo,
};
use opflex_agent::packetin::{PacketIn, PacketInAction, PacketInHandler, ReplyBuilder};
use opflex_agent::policy::{
    ArpNdMode, BridgeDomain, DhcpConfig, Endpoint, EndpointGroup, IntraGroupPolicy, UnknownFloodMode,
};
use opflex_agent::switch::SwitchManager;
use opflex_common::IdGenerator;
use opflex_types::{IpAddress, Ipv4Address, MacAddress};
use ofswitch::PortNo;

fn sample_epg() -> EndpointGroup {
    EndpointGroup {
        uri: "/PolicyUniverse/EpgA".into(),
        vnid: 5000,
        bridge_domain: "/BridgeDomain/bd0".into(),
        flood_domain: None,
        routing_domain: Some("/RoutingDomain/rd0".into()),
        intra_group_policy: IntraGroupPolicy::Allow,
        multicast_group: None,
    }
}

fn sample_bd() -> BridgeDomain {
    BridgeDomain {
        uri: "/BridgeDomain/bd0".into(),
        routing_enabled: true,
        unknown_flood_mode: UnknownFloodMode::Flood,
        arp_nd_mode: ArpNdMode::Unicast,
        router_mac: Some(MacAddress::new([0, 0x22, 0xbd, 1, 1, 1])),
        subnets: vec![],
    }
}

fn sample_endpoint() -> Endpoint {
    Endpoint {
        uuid: "ep0".into(),
        mac: Some(MacAddress::new([0, 1, 2, 3, 4, 5])),
        ips: vec![IpAddress::V4(Ipv4Address::new(10, 0, 0, 10))],
        interface_name: Some("veth0".into()),
        access_interface_name: Some("veth0-access".into()),
        epg: "/PolicyUniverse/EpgA".into(),
        security_groups: HashSet::new(),
        virtual_ips: vec![],
        ip_mappings: vec![],
        dhcp: DhcpConfig::default(),
        promiscuous: false,
        discovery_proxy: false,
    }
}

/// Resolving an EPG's forwarding ids and rendering both the EPG-wide
/// flows and one endpoint's flows should together produce a flow set
/// that `SwitchManager::write_flow` can apply without error, and a
/// second identical render should diff to nothing.
#[tokio::test]
async fn test_policy_render_then_switch_write_flow_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut idgen = IdGenerator::new(dir.path(), Duration::from_secs(300));

    let epg = sample_epg();
    let fwd = get_group_forwarding_info(&mut idgen, &epg).expect("forwarding info should resolve");
    assert_eq!(fwd.vnid, 5000);

    let bd = sample_bd();
    let epg_render = render_epg(&epg, &bd, &fwd, PortNo(1));
    assert!(!epg_render.bridge.is_empty(), "EPG render should produce at least the unknown-unicast fallback");

    let ep = sample_endpoint();
    let ep_render = render_endpoint(&ep, &fwd, PortNo(3), bd.router_mac.unwrap());
    assert!(!ep_render.sec.is_empty());
    assert!(!ep_render.bridge.is_empty());

    let (conn, _rx) = SwitchConnection::new("br-int");
    conn.begin_connecting().await;
    conn.complete_handshake().await;
    let switch = Arc::new(SwitchManager::new(conn));

    let obj = ObjectKey(1);
    switch
        .write_flow(
            obj,
            tables::BRIDGE,
            ep_render.bridge.clone(),
            |_, xid| xid.0.to_be_bytes().to_vec(),
            |xid| xid.0.to_be_bytes().to_vec(),
        )
        .await
        .unwrap();

    // Re-submitting the identical render diffs to nothing and is a no-op.
    switch
        .write_flow(
            obj,
            tables::BRIDGE,
            ep_render.bridge,
            |_, xid| xid.0.to_be_bytes().to_vec(),
            |xid| xid.0.to_be_bytes().to_vec(),
        )
        .await
        .unwrap();
}

/// A sweep (writing an empty flow list for a key) should remove
/// everything that key previously owned.
#[tokio::test]
async fn test_switch_sweep_removes_owned_flows() {
    let (conn, _rx) = SwitchConnection::new("br-int");
    conn.begin_connecting().await;
    conn.complete_handshake().await;
    let switch = Arc::new(SwitchManager::new(conn));

    let obj = ObjectKey(42);
    let flow = ofswitch::FlowEntry {
        table: TableId(2),
        priority: 10,
        cookie: ofswitch::Cookie(0),
        match_: ofswitch::Match::builder().build(),
        instructions: vec![],
    };

    switch
        .write_flow(obj, TableId(2), vec![flow], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec())
        .await
        .unwrap();

    switch
        .write_flow(obj, TableId(2), vec![], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec())
        .await
        .unwrap();
}

struct StubReplies;
impl ReplyBuilder for StubReplies {
    fn build_nd_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
        Some(vec![0xaa])
    }
    fn build_dhcp_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
        Some(vec![0xbb])
    }
    fn build_vip_reply(&self, _pkt: &PacketIn) -> Option<Vec<u8>> {
        None
    }
}

/// An endpoint with a DHCP config gets a controller-punt flow in SEC,
/// and a packet-in carrying that flow's cookie dispatches to the DHCP
/// reply path end to end.
#[test]
fn test_dhcp_endpoint_punt_flow_dispatches_to_reply_builder() {
    let mut ep = sample_endpoint();
    ep.dhcp.ipv4 = Some(opflex_agent::policy::Dhcp4Config { server_ip: None, lease_seconds: None, dns_servers: vec![] });

    let fwd = GroupForwardingInfo { bd_id: 100, fd_id: None, rd_id: Some(101), vnid: 5000 };
    let render = render_endpoint(&ep, &fwd, PortNo(3), MacAddress::new([0, 0x22, 0xbd, 1, 1, 1]));
    let dhcp_flow = render.sec.iter().find(|f| f.cookie == opflex_agent::intflow::DHCP_COOKIE).expect("punt flow");

    let handler = PacketInHandler::new();
    let pkt = PacketIn { cookie: dhcp_flow.cookie, in_port: PortNo(3), src_mac: ep.mac.unwrap(), buffer_id: Some(7) };
    match handler.dispatch(&pkt, &StubReplies) {
        PacketInAction::Reply { data, out_port } => {
            assert_eq!(data, vec![0xbb]);
            assert_eq!(out_port, PortNo(3));
        }
        _ => panic!("expected a DHCP reply"),
    }
}

/// Registering several managers with the daemon and sending a connection
/// notification over its event channel should reach every manager, in
/// priority order for the per-tick dispatch path.
#[tokio::test]
async fn test_daemon_dispatches_managers_and_forwards_notifications() {
    use async_trait::async_trait;
    use opflex_common::Orch;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingManager {
        name: &'static str,
        priority: i32,
        notified: Arc<Mutex<Vec<String>>>,
        resynced: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Orch for RecordingManager {
        fn name(&self) -> &str {
            self.name
        }
        async fn do_task(&mut self) {}
        fn priority(&self) -> i32 {
            self.priority
        }
        fn on_notification(&mut self, notification: &str) {
            self.notified.lock().unwrap().push(notification.to_string());
        }
        fn on_reconnect_resync(&mut self) {
            self.resynced.store(true, Ordering::SeqCst);
        }
    }

    let mut daemon = AgentDaemon::new(Duration::from_millis(1));
    let notified = Arc::new(Mutex::new(Vec::new()));
    let resynced = Arc::new(AtomicBool::new(false));

    daemon.register(Box::new(RecordingManager {
        name: "access",
        priority: 10,
        notified: notified.clone(),
        resynced: resynced.clone(),
    }));
    daemon.register(Box::new(RecordingManager {
        name: "integration",
        priority: -5,
        notified: notified.clone(),
        resynced: resynced.clone(),
    }));

    let tx = daemon.event_sender();
    tx.send(AgentEvent::Notification("br-int:packet-in".into())).unwrap();
    tx.send(AgentEvent::ReconnectResync).unwrap();

    let stop = daemon.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        stop.store(true, Ordering::SeqCst);
    });
    daemon.run().await;

    assert_eq!(notified.lock().unwrap().len(), 2, "both managers should have seen the notification");
    assert!(resynced.load(Ordering::SeqCst));
}

/// Conntrack zones allocated for the access pipeline and the integration
/// pipeline never collide, and persist across a fresh `IdGenerator`
/// rooted at the same cache directory.
#[test]
fn test_conntrack_zones_persist_across_idgen_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = ConntrackZoneManager::new(1, 100);

    let zone_before = {
        let mut idgen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        mgr.zone_for_endpoint(&mut idgen, "ep0").unwrap()
    };

    let zone_after = {
        let mut idgen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        mgr.zone_for_endpoint(&mut idgen, "ep0").unwrap()
    };

    assert_eq!(zone_before, zone_after, "zone assignment should survive a restart via the id-cache directory");
}

/// `HashMap`-keyed table diffing used during `initiate_sync` should
/// converge to zero outstanding diffs on a second call with the same
/// snapshot.
#[tokio::test]
async fn test_switch_manager_sync_is_idempotent() {
    let (conn, _rx) = SwitchConnection::new("br-int");
    conn.begin_connecting().await;
    conn.complete_handshake().await;
    let switch = Arc::new(SwitchManager::new(conn));

    switch.initiate_sync(HashMap::new(), vec![], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec()).await.unwrap();
    assert!(!switch.is_syncing());

    switch.initiate_sync(HashMap::new(), vec![], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec()).await.unwrap();
    assert!(!switch.is_syncing());
}
