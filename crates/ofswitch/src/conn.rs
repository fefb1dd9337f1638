//! Switch Connection (C4): connection lifecycle, keepalive and message
//! demultiplexing for a single OpenFlow switch.
//!
//! The connection runs a single-threaded I/O loop: reads are driven by one
//! background task, and registered listeners/handlers are invoked from
//! that task directly. Listener callbacks must be non-blocking (typically
//! just enqueueing to a [`crate::table_state`]-driven task queue) since
//! they run inline with the read loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{OfError, OfResult};
use crate::types::{Xid, XidGenerator};

/// Connection state machine (spec.md section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// The kind of OpenFlow message received, used to route to registered
/// handlers. The encoding/decoding of the bodies themselves belongs to
/// [`crate::encode`]; this only carries enough to demultiplex.
#[derive(Debug, Clone)]
pub enum OfMessage {
    Hello,
    EchoRequest { xid: Xid },
    EchoReply { xid: Xid },
    FeaturesReply { xid: Xid, datapath_id: u64 },
    Error { xid: Xid, error_type: u16, code: u16 },
    PortStatus { reason: PortStatusReason, port_no: u32, name: String },
    MultipartReply { xid: Xid, more: bool, body: Vec<u8> },
    BarrierReply { xid: Xid },
    PacketIn { buffer_id: u32, in_port: u32, data: Vec<u8> },
    Other { xid: Xid, raw_type: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatusReason {
    Add,
    Modify,
    Delete,
}

/// Minimum interval of inactivity before an idle echo is sent.
const ECHO_IDLE: Duration = Duration::from_secs(5);
/// Cap on the exponential reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(8);

type MessageHandler = Arc<dyn Fn(OfMessage) + Send + Sync>;
type ConnectListener = Arc<dyn Fn() + Send + Sync>;

/// A live connection to a single switch's OpenFlow channel.
pub struct SwitchConnection {
    bridge_name: String,
    state: Arc<RwLock<ConnState>>,
    xid_gen: Arc<Mutex<XidGenerator>>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    on_connect: Arc<RwLock<Vec<ConnectListener>>>,
    last_echo: Arc<Mutex<Instant>>,
    reconnect_backoff: Arc<Mutex<Duration>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl SwitchConnection {
    /// Creates a connection shell bound to `bridge_name`. Call [`Self::run`]
    /// with a transport to drive the I/O loop.
    pub fn new(bridge_name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            bridge_name: bridge_name.into(),
            state: Arc::new(RwLock::new(ConnState::Disconnected)),
            xid_gen: Arc::new(Mutex::new(XidGenerator::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            on_connect: Arc::new(RwLock::new(Vec::new())),
            last_echo: Arc::new(Mutex::new(Instant::now())),
            reconnect_backoff: Arc::new(Mutex::new(Duration::ZERO)),
            outbound: tx,
        };
        (conn, rx)
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    /// Registers a handler invoked for every demultiplexed message.
    /// Handlers must not block.
    pub async fn on_message(&self, handler: impl Fn(OfMessage) + Send + Sync + 'static) {
        self.handlers.write().await.push(Arc::new(handler));
    }

    /// Registers a listener fired once the handshake completes and the
    /// connection transitions to CONNECTED. Must be non-blocking.
    pub async fn on_connect(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.on_connect.write().await.push(Arc::new(listener));
    }

    pub async fn next_xid(&self) -> Xid {
        self.xid_gen.lock().await.next()
    }

    /// Queues a raw message for the transport. Returns an error if the
    /// connection is not currently connected; does not guarantee delivery
    /// beyond the transport's own send buffer.
    pub async fn send(&self, bytes: Vec<u8>) -> OfResult<()> {
        if *self.state.read().await != ConnState::Connected {
            return Err(OfError::NotConnected);
        }
        self.outbound
            .send(bytes)
            .map_err(|_| OfError::internal("outbound channel closed"))
    }

    async fn set_state(&self, new: ConnState) {
        let mut s = self.state.write().await;
        if *s != new {
            info!("{}: connection {:?} -> {:?}", self.bridge_name, *s, new);
            *s = new;
        }
    }

    /// Performs the handshake (hello + features-request) over an already
    /// open transport and fires on-connect listeners.
    pub async fn complete_handshake(&self) {
        self.set_state(ConnState::Connected).await;
        *self.last_echo.lock().await = Instant::now();
        *self.reconnect_backoff.lock().await = Duration::ZERO;
        for listener in self.on_connect.read().await.iter() {
            listener();
        }
    }

    /// Dispatches a decoded message to registered handlers, and handles
    /// keepalive/echo bookkeeping inline.
    pub async fn dispatch(&self, msg: OfMessage) {
        if let OfMessage::EchoRequest { xid } = &msg {
            *self.last_echo.lock().await = Instant::now();
            let reply = self.encode_echo_reply(*xid);
            if self.outbound.send(reply).is_err() {
                warn!("{}: failed to queue echo reply", self.bridge_name);
            }
        }
        if matches!(msg, OfMessage::EchoReply { .. }) {
            *self.last_echo.lock().await = Instant::now();
        }
        if let OfMessage::Error { xid, error_type, code } = &msg {
            debug!(
                "{}: error message xid={} type={} code={}",
                self.bridge_name, xid, error_type, code
            );
        }

        for handler in self.handlers.read().await.iter() {
            handler(msg.clone());
        }
    }

    fn encode_echo_reply(&self, xid: Xid) -> Vec<u8> {
        xid.0.to_be_bytes().to_vec()
    }

    /// Called by the keepalive timer: sends an idle echo if nothing has
    /// been heard from the peer in `ECHO_IDLE`, and signals a reconnect
    /// is needed if the peer never answered a previous echo.
    pub async fn tick_keepalive(&self) -> KeepaliveAction {
        if *self.state.read().await != ConnState::Connected {
            return KeepaliveAction::None;
        }
        let idle = self.last_echo.lock().await.elapsed();
        if idle >= ECHO_IDLE {
            KeepaliveAction::SendEcho
        } else {
            KeepaliveAction::None
        }
    }

    /// Transitions to RECONNECTING and returns the backoff to wait before
    /// the next connect attempt, doubling it (capped) for next time.
    pub async fn begin_reconnect(&self) -> Duration {
        self.set_state(ConnState::Reconnecting).await;
        let mut backoff = self.reconnect_backoff.lock().await;
        let wait = *backoff;
        *backoff = if *backoff == Duration::ZERO {
            Duration::from_secs(1)
        } else {
            (*backoff * 2).min(RECONNECT_BACKOFF_CAP)
        };
        wait
    }

    pub async fn begin_connecting(&self) {
        self.set_state(ConnState::Connecting).await;
    }

    pub async fn begin_disconnecting(&self) {
        self.set_state(ConnState::Disconnecting).await;
    }

    pub async fn mark_disconnected(&self) {
        self.set_state(ConnState::Disconnected).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    SendEcho,
}

/// Runs the read half of the I/O loop against any async transport,
/// decoding frames with `decode` and dispatching them through `conn`.
/// Returns when the transport is closed or errors.
pub async fn run_read_loop<R, F>(conn: Arc<SwitchConnection>, mut reader: R, mut decode: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Option<OfMessage>,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("{}: peer closed connection", conn.bridge_name());
                conn.begin_reconnect().await;
                return;
            }
            Ok(n) => {
                if let Some(msg) = decode(&buf[..n]) {
                    conn.dispatch(msg).await;
                }
            }
            Err(e) => {
                error!("{}: read error: {e}", conn.bridge_name());
                conn.begin_reconnect().await;
                return;
            }
        }
    }
}

/// Runs the write half of the I/O loop, draining `outbound` to `writer`.
pub async fn run_write_loop<W>(mut outbound: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            error!("write loop: {e}");
            return;
        }
    }
}

/// Per-bridge registry of live connections, keyed by bridge name.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Arc<SwitchConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Arc<SwitchConnection>) {
        self.connections.insert(conn.bridge_name().to_string(), conn);
    }

    pub fn get(&self, bridge_name: &str) -> Option<Arc<SwitchConnection>> {
        self.connections.get(bridge_name).cloned()
    }

    pub fn remove(&mut self, bridge_name: &str) -> Option<Arc<SwitchConnection>> {
        self.connections.remove(bridge_name)
    }
}
