//! OpFlex OVS agent entry point: loads config, brings up one `SwitchManager`
//! per managed bridge, and runs the single-threaded dispatch loop until a
//! termination signal arrives (spec.md sections 5-6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use ofswitch::{encode_flow_entry, ConnectionRegistry, FlowEdit, OfMessage, SwitchConnection, Xid};
use opflex_common::IdGenerator;
use opflex_agent::advert::AdvertisementManager;
use opflex_agent::audit::{init_logging, init_logging_pretty};
use opflex_agent::config::Config;
use opflex_agent::conntrack::ConntrackZoneManager;
use opflex_agent::daemon::{AgentDaemon, AgentEvent};
use opflex_agent::intflow::{update_platform_config, FloodGroupTable, MulticastMap};
use opflex_agent::packetin::PacketInHandler;
use opflex_agent::span::{NetFlowRenderer, SpanRenderer};
use opflex_agent::switch::SwitchManager;
use opflex_agent::tunnelep::{InterfaceInfo, InterfaceSource, TunnelEndpointManager};
use opflex_types::MacAddress;

#[derive(Parser, Debug)]
#[command(name = "opflex-agent")]
#[command(author, version, about = "OpFlex-driven OVS rendering agent", long_about = None)]
struct Args {
    /// Path to the agent's JSON configuration file.
    #[arg(short = 'c', long, default_value = "/etc/opflex-agent/agent-ovs.conf")]
    config: PathBuf,

    /// Overrides the config file's `log-level`.
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Use human-readable log output instead of JSON (development only).
    #[arg(long)]
    pretty_logs: bool,
}

/// Reads interface identity from `/sys/class/net` (std-only; no IPv4/IPv6
/// address source is available without a netlink-capable crate, so
/// `ipv4`/`ipv6` are left empty — a real deployment needs `nix::ifaddrs`
/// wired in alongside this).
struct SysfsInterfaceSource;

impl InterfaceSource for SysfsInterfaceSource {
    fn list_interfaces(&self) -> Vec<InterfaceInfo> {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let operstate = std::fs::read_to_string(e.path().join("operstate")).unwrap_or_default();
                Some(InterfaceInfo {
                    up: operstate.trim() == "up",
                    loopback: name == "lo",
                    name,
                    ipv4: Vec::new(),
                    ipv6: Vec::new(),
                })
            })
            .collect()
    }

    fn read_mac(&self, interface_name: &str) -> Option<MacAddress> {
        let text = std::fs::read_to_string(format!("/sys/class/net/{interface_name}/address")).ok()?;
        text.trim().parse().ok()
    }
}

fn encode_edit(edit: &FlowEdit, xid: Xid) -> Vec<u8> {
    let entry = match edit {
        FlowEdit::Add(e) | FlowEdit::Mod(e) | FlowEdit::Del(e) => e,
    };
    let mut bytes = encode_flow_entry(entry).unwrap_or_default();
    bytes.extend_from_slice(&xid.0.to_be_bytes());
    bytes
}

fn encode_barrier(xid: Xid) -> Vec<u8> {
    xid.0.to_be_bytes().to_vec()
}

/// Binds an OpenFlow listener for one bridge: OVS dials in as the
/// OpenFlow client (`ovs-vsctl set-controller <br> tcp:<addr>`), this
/// agent plays controller. Each accepted socket drives one connection's
/// read/write loops. Only the first accepted socket after a (re)bind
/// gets its write half wired to `outbound_rx`, since the connection's
/// outbound channel has a single consumer; a later reconnect re-pairs
/// the read loop but keeps writing through the original socket's write
/// half until that socket itself closes (see DESIGN.md).
async fn accept_loop(
    listener: tokio::net::TcpListener,
    conn: Arc<SwitchConnection>,
    mut outbound_rx: Option<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("{}: accepted OpenFlow connection from {peer}", conn.bridge_name());
                let (reader, writer) = tokio::io::split(stream);
                conn.begin_connecting().await;
                conn.complete_handshake().await;
                let read_conn = conn.clone();
                tokio::spawn(ofswitch::conn::run_read_loop(read_conn, reader, |_bytes| {
                    // Real OpenFlow header parsing is out of this crate's
                    // scope (see DESIGN.md); nothing is demultiplexed yet.
                    None::<OfMessage>
                }));
                if let Some(rx) = outbound_rx.take() {
                    tokio::spawn(ofswitch::conn::run_write_loop(rx, writer));
                }
            }
            Err(e) => {
                warn!("{}: accept failed: {e}", conn.bridge_name());
            }
        }
    }
}

fn bring_up_bridge(
    daemon: &AgentDaemon,
    bridge_name: String,
    port: u16,
) -> std::io::Result<(Arc<SwitchManager>, Arc<SwitchConnection>)> {
    let (conn, outbound_rx) = SwitchConnection::new(bridge_name.clone());
    let conn = Arc::new(conn);
    let manager = Arc::new(SwitchManager::new(conn.clone()));

    let event_tx = daemon.event_sender();
    let on_connect_bridge = bridge_name.clone();
    let on_connect_manager = manager.clone();
    tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.on_connect(move || {
                info!("{on_connect_bridge}: connected, scheduling reconciliation sync");
                let _ = event_tx.send(AgentEvent::ReconnectResync);
                let manager = on_connect_manager.clone();
                tokio::spawn(async move {
                    let _ = manager
                        .run_sync_after_delay(HashMap::new(), Vec::new(), encode_edit, encode_barrier)
                        .await;
                });
            })
            .await;
        }
    });

    let event_tx = daemon.event_sender();
    let notify_bridge = bridge_name.clone();
    tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.on_message(move |msg: OfMessage| {
                let summary = match msg {
                    OfMessage::PacketIn { .. } => "packet-in",
                    OfMessage::PortStatus { .. } => "port-status",
                    OfMessage::Error { .. } => "error",
                    _ => "other",
                };
                let _ = event_tx.send(AgentEvent::Notification(format!("{notify_bridge}:{summary}")));
            })
            .await;
        }
    });

    let bind_addr = format!("127.0.0.1:{port}");
    let std_listener = std::net::TcpListener::bind(&bind_addr)?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;
    info!("{bridge_name}: listening for OpenFlow connections on {bind_addr}");
    tokio::spawn(accept_loop(listener, conn.clone(), Some(outbound_rx)));

    Ok((manager, conn))
}

async fn run(config: Config) -> ExitCode {
    let mut daemon = AgentDaemon::new(opflex_agent::daemon::DEFAULT_TICK_INTERVAL);

    let int_bridge = match bring_up_bridge(&daemon, config.int_bridge_name.clone(), 6633) {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to bring up integration bridge {}: {e}", config.int_bridge_name);
            return ExitCode::FAILURE;
        }
    };
    let access_bridge = match bring_up_bridge(&daemon, config.access_bridge_name.clone(), 6634) {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to bring up access bridge {}: {e}", config.access_bridge_name);
            return ExitCode::FAILURE;
        }
    };

    let mut registry = ConnectionRegistry::new();
    registry.insert(int_bridge.1);
    registry.insert(access_bridge.1);

    let mut idgen = IdGenerator::new(config.flowid_cache_dir.clone(), Duration::from_secs(300));
    let conntrack = ConntrackZoneManager::new(
        config.forwarding.connection_tracking.zone_range.start,
        config.forwarding.connection_tracking.zone_range.end,
    );
    let _ = conntrack.zone_for_routing_domain(&mut idgen, &config.int_bridge_name);

    let mut advert_mgr = AdvertisementManager::new(config.forwarding.endpoint_advertisements.mode);
    if config.forwarding.virtual_router.enabled {
        advert_mgr.register_router(
            config.int_bridge_name.clone(),
            Duration::from_secs(config.forwarding.endpoint_advertisements.tunnel_endpoint_interval_secs.max(1)),
            std::time::Instant::now(),
        );
    }

    let mut tunnel_ep = TunnelEndpointManager::new(format!("{}-tep", config.int_bridge_name), {
        let iface = config.encap.uplink_iface.clone();
        if iface.is_empty() {
            None
        } else {
            Some(iface)
        }
    });
    let _ = tunnel_ep.scan(&SysfsInterfaceSource);

    // Platform-config update (spec.md section 4.10): seed the flood-group
    // table's multicast tunnel destination from whatever is already on
    // disk; later MODB-driven updates call `update_platform_config` again
    // as the configured EPG/flood-domain multicast IPs change.
    let mut mcast_map = MulticastMap::new();
    let mut flood_groups = FloodGroupTable::new();
    let _ = update_platform_config(&config.mcast_group_file, &mut mcast_map, &mut flood_groups, &config.int_bridge_name, None);

    let _packet_in = PacketInHandler::new();
    let _span = SpanRenderer::new();
    let _netflow = NetFlowRenderer::new();

    info!(
        "opflex-agent started: int-bridge={} access-bridge={}",
        config.int_bridge_name, config.access_bridge_name
    );

    let stop_handle = daemon.stop_handle();
    let event_tx_for_signals = daemon.event_sender();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .expect("failed to install SIGUSR1 handler");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, stopping");
                    stop_handle.store(true, std::sync::atomic::Ordering::SeqCst);
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, stopping");
                    stop_handle.store(true, std::sync::atomic::Ordering::SeqCst);
                    break;
                }
                _ = sigusr1.recv() => {
                    let _ = event_tx_for_signals.send(AgentEvent::DumpRequested);
                }
            }
        }
    });

    daemon.run().await;
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    let effective_log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    if args.pretty_logs {
        init_logging_pretty(&effective_log_level);
    } else {
        init_logging(&effective_log_level);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(config))
}
