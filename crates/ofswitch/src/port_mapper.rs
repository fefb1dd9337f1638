//! Port Mapper (C5): maintains the name<->port-number mapping for a
//! bridge, seeded by a port-description multipart request on connect and
//! kept current by port-status notifications.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::sync::RwLock;

use crate::conn::{OfMessage, PortStatusReason, SwitchConnection};
use crate::types::{PortNo, Xid};

#[derive(Debug, Default, Clone)]
struct PortMaps {
    by_name: HashMap<String, PortNo>,
    by_port: HashMap<PortNo, String>,
}

impl PortMaps {
    fn insert(&mut self, name: String, port: PortNo) {
        self.by_name.insert(name.clone(), port);
        self.by_port.insert(port, name);
    }

    fn remove_port(&mut self, port: PortNo) {
        if let Some(name) = self.by_port.remove(&port) {
            self.by_name.remove(&name);
        }
    }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Tracks live port mappings for one switch connection.
pub struct PortMapper {
    live: RwLock<PortMaps>,
    temp: RwLock<PortMaps>,
    last_desc_xid: RwLock<Option<Xid>>,
    listeners: RwLock<Vec<Listener>>,
}

impl Default for PortMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMapper {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(PortMaps::default()),
            temp: RwLock::new(PortMaps::default()),
            last_desc_xid: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a listener invoked whenever the live maps change.
    /// `from_desc` is true when the update came from the initial
    /// port-description read-back rather than a live port-status event.
    pub async fn on_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.listeners.write().await.push(Arc::new(listener));
    }

    async fn notify(&self, from_desc: bool) {
        for listener in self.listeners.read().await.iter() {
            listener(from_desc);
        }
    }

    /// Sends the initial port-description request on connect, resetting
    /// the temp maps and recording the request's xid.
    pub async fn request_port_descriptions(&self, conn: &SwitchConnection) {
        *self.temp.write().await = PortMaps::default();
        let xid = conn.next_xid().await;
        *self.last_desc_xid.write().await = Some(xid);
        // Encoding the actual multipart request body is the caller's
        // responsibility via crate::encode; this records correlation state.
        let _ = conn.send(xid.0.to_be_bytes().to_vec()).await;
    }

    /// Appends one port-description entry from a multipart reply matching
    /// the outstanding request xid. On `more == false` the accumulated
    /// temp maps atomically replace the live maps.
    pub async fn handle_desc_reply(&self, xid: Xid, name: String, port: PortNo, more: bool) {
        let expected = *self.last_desc_xid.read().await;
        if expected != Some(xid) {
            return;
        }
        self.temp.write().await.insert(name, port);
        if !more {
            let swapped = self.temp.read().await.clone();
            *self.live.write().await = swapped;
            *self.last_desc_xid.write().await = None;
            info!("port mapper: swapped in {} ports from description reply", self.live.read().await.by_name.len());
            self.notify(true).await;
        }
    }

    /// Handles an asynchronous port-status notification.
    pub async fn handle_port_status(&self, reason: PortStatusReason, port: PortNo, name: String) {
        {
            let mut live = self.live.write().await;
            match reason {
                PortStatusReason::Add | PortStatusReason::Modify => live.insert(name, port),
                PortStatusReason::Delete => live.remove_port(port),
            }
        }
        self.notify(false).await;
    }

    /// Convenience dispatcher for messages coming off a [`SwitchConnection`].
    pub async fn handle_message(&self, msg: &OfMessage) {
        if let OfMessage::PortStatus { reason, port_no, name } = msg {
            self.handle_port_status(*reason, PortNo(*port_no), name.clone()).await;
        }
    }

    pub async fn find_port_by_name(&self, name: &str) -> Option<PortNo> {
        self.live.read().await.by_name.get(name).copied()
    }

    pub async fn find_name_by_port(&self, port: PortNo) -> Option<String> {
        self.live.read().await.by_port.get(&port).cloned()
    }

    pub async fn port_count(&self) -> usize {
        self.live.read().await.by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_desc_reply_swap_is_atomic_on_last_fragment() {
        let mapper = PortMapper::new();
        *mapper.last_desc_xid.write().await = Some(Xid(1));

        mapper.handle_desc_reply(Xid(1), "eth0".into(), PortNo(1), true).await;
        assert_eq!(mapper.find_port_by_name("eth0").await, None, "not visible until !more");

        mapper.handle_desc_reply(Xid(1), "eth1".into(), PortNo(2), false).await;
        assert_eq!(mapper.find_port_by_name("eth0").await, Some(PortNo(1)));
        assert_eq!(mapper.find_port_by_name("eth1").await, Some(PortNo(2)));
    }

    #[tokio::test]
    async fn test_desc_reply_ignores_stale_xid() {
        let mapper = PortMapper::new();
        *mapper.last_desc_xid.write().await = Some(Xid(2));
        mapper.handle_desc_reply(Xid(1), "eth0".into(), PortNo(1), false).await;
        assert_eq!(mapper.find_port_by_name("eth0").await, None);
    }

    #[tokio::test]
    async fn test_port_status_add_and_delete() {
        let mapper = PortMapper::new();
        mapper
            .handle_port_status(PortStatusReason::Add, PortNo(3), "eth3".into())
            .await;
        assert_eq!(mapper.find_name_by_port(PortNo(3)).await, Some("eth3".into()));

        mapper
            .handle_port_status(PortStatusReason::Delete, PortNo(3), "eth3".into())
            .await;
        assert_eq!(mapper.find_name_by_port(PortNo(3)).await, None);
    }

    #[tokio::test]
    async fn test_listener_fires_with_from_desc_flag() {
        let mapper = PortMapper::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen2 = seen.clone();
        mapper
            .on_change(move |from_desc| {
                let seen3 = seen2.clone();
                tokio::spawn(async move {
                    seen3.write().await.push(from_desc);
                });
            })
            .await;

        mapper
            .handle_port_status(PortStatusReason::Add, PortNo(1), "eth0".into())
            .await;
        tokio::task::yield_now().await;
        assert_eq!(*seen.read().await, vec![false]);
    }
}
