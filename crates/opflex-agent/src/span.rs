//! Span/NetFlow Renderers (C17): ERSPAN mirror and NetFlow configuration
//! pushed over OVSDB-JSON-RPC. Explicitly out of CORE scope (spec.md
//! section 6) — the CORE only ever reaches OVS through this
//! bridge-abstracted facade, never by speaking JSON-RPC itself.

use std::collections::HashMap;

use opflex_types::IpAddress;

/// One ERSPAN mirror session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSession {
    pub uri: String,
    pub src_ports: Vec<String>,
    pub dst_ip: IpAddress,
    pub erspan_id: u8,
}

/// NetFlow exporter configuration for one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetFlowConfig {
    pub target: (IpAddress, u16),
    pub active_timeout_secs: u32,
    pub add_id_to_interface: bool,
}

/// The OVSDB operations the CORE needs, named after spec.md section 6's
/// operation list. A production implementation issues JSON-RPC `transact`
/// calls against the bridge's OVSDB socket; tests substitute a stub.
pub trait OvsdbFacade {
    fn get_bridge_uuid(&mut self, bridge_name: &str) -> Option<String>;
    fn get_bridge_port_list(&mut self, bridge_uuid: &str) -> Vec<String>;
    fn add_mirror(&mut self, bridge_uuid: &str, session: &MirrorSession) -> Result<String, String>;
    fn del_mirror(&mut self, mirror_uuid: &str) -> Result<(), String>;
    fn add_erspan_port(&mut self, bridge_uuid: &str, session: &MirrorSession) -> Result<String, String>;
    fn del_erspan_port(&mut self, port_uuid: &str) -> Result<(), String>;
    fn update_bridge_ports(&mut self, bridge_uuid: &str, port_uuids: &[String]) -> Result<(), String>;
    fn set_netflow(&mut self, bridge_uuid: &str, config: &NetFlowConfig) -> Result<(), String>;
    fn clear_netflow(&mut self, bridge_uuid: &str) -> Result<(), String>;
}

struct ActiveMirror {
    mirror_uuid: String,
    erspan_port_uuid: String,
}

/// Renders mirror sessions, tracking the OVSDB rows each one created so a
/// later removal cleans them up precisely rather than re-deriving state.
#[derive(Default)]
pub struct SpanRenderer {
    active: HashMap<String, ActiveMirror>,
}

impl SpanRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(
        &mut self,
        facade: &mut dyn OvsdbFacade,
        bridge_name: &str,
        session: &MirrorSession,
    ) -> Result<(), String> {
        let bridge_uuid =
            facade.get_bridge_uuid(bridge_name).ok_or_else(|| format!("unknown bridge {bridge_name}"))?;
        let erspan_port_uuid = facade.add_erspan_port(&bridge_uuid, session)?;
        let mirror_uuid = facade.add_mirror(&bridge_uuid, session)?;
        let port_uuids = facade.get_bridge_port_list(&bridge_uuid);
        facade.update_bridge_ports(&bridge_uuid, &port_uuids)?;
        self.active.insert(session.uri.clone(), ActiveMirror { mirror_uuid, erspan_port_uuid });
        Ok(())
    }

    pub fn remove(&mut self, facade: &mut dyn OvsdbFacade, session_uri: &str) -> Result<(), String> {
        let Some(active) = self.active.remove(session_uri) else {
            return Ok(());
        };
        facade.del_mirror(&active.mirror_uuid)?;
        facade.del_erspan_port(&active.erspan_port_uuid)?;
        Ok(())
    }

    pub fn is_active(&self, session_uri: &str) -> bool {
        self.active.contains_key(session_uri)
    }
}

/// Renders at most one active NetFlow configuration per bridge.
#[derive(Default)]
pub struct NetFlowRenderer {
    applied: Option<NetFlowConfig>,
}

impl NetFlowRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        facade: &mut dyn OvsdbFacade,
        bridge_name: &str,
        config: NetFlowConfig,
    ) -> Result<(), String> {
        let bridge_uuid =
            facade.get_bridge_uuid(bridge_name).ok_or_else(|| format!("unknown bridge {bridge_name}"))?;
        facade.set_netflow(&bridge_uuid, &config)?;
        self.applied = Some(config);
        Ok(())
    }

    pub fn clear(&mut self, facade: &mut dyn OvsdbFacade, bridge_name: &str) -> Result<(), String> {
        if self.applied.is_none() {
            return Ok(());
        }
        let bridge_uuid =
            facade.get_bridge_uuid(bridge_name).ok_or_else(|| format!("unknown bridge {bridge_name}"))?;
        facade.clear_netflow(&bridge_uuid)?;
        self.applied = None;
        Ok(())
    }

    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }
}
