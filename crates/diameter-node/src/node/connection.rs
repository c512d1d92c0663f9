use crate::config::Capability;
use crate::config::Peer;
use crate::config::TransportKind;
use crate::node::timers::ConnectionTimers;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque handle for a connection, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
    pub(crate) fn next() -> Self {
        ConnectionKey(KEY_COUNTER.fetch_add(1, Ordering::AcqRel))
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound socket not yet established.
    Connecting,
    /// Accepted; waiting for the peer's CER.
    ConnectedIn,
    /// Connected; our CER is out, waiting for the CEA.
    ConnectedOut,
    /// Reserved for inband security. Never entered; frames observed in
    /// this state are rejected rather than silently passed through.
    Tls,
    Ready,
    /// DPR sent, draining until the DPA or a deadline.
    Closing,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedIn => "connected-in",
            ConnectionState::ConnectedOut => "connected-out",
            ConnectionState::Tls => "tls",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        name.fmt(f)
    }
}

/// How a connection task should tear its socket down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Close {
    /// Write out whatever is queued, then shut down.
    Flush,
    /// Drop the socket immediately.
    Reset,
}

/// What the listener gets to see of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub state: ConnectionState,
    pub host_id: Option<String>,
    pub peer: Option<Peer>,
}

/// Protocol-level state of one peer connection.
///
/// The transport driver's task owns the socket; everything in here is
/// owned by the registry and only touched under the registry mutex.
pub(crate) struct Connection {
    pub key: ConnectionKey,
    pub state: ConnectionState,
    pub host_id: Option<String>,
    pub peer: Option<Peer>,
    pub peer_capabilities: Option<Capability>,
    pub timers: ConnectionTimers,
    pub transport: TransportKind,
    /// Encoded frames queued for the connection task's writer.
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub control: mpsc::UnboundedSender<Close>,
    pub local_addresses: Vec<IpAddr>,
    pub remote_address: Option<SocketAddr>,
    /// Set once `connection_up` fired, so `connection_down` fires
    /// exactly once and only for connections the listener saw come up.
    pub announced_up: bool,
    hop_by_hop: u32,
}

impl Connection {
    pub(crate) fn new(
        state: ConnectionState,
        transport: TransportKind,
        timers: ConnectionTimers,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        control: mpsc::UnboundedSender<Close>,
    ) -> Self {
        Connection {
            key: ConnectionKey::next(),
            state,
            host_id: None,
            peer: None,
            peer_capabilities: None,
            timers,
            transport,
            outbound,
            control,
            local_addresses: Vec::new(),
            remote_address: None,
            announced_up: false,
            hop_by_hop: rand::random(),
        }
    }

    pub(crate) fn next_hop_by_hop(&mut self) -> u32 {
        let id = self.hop_by_hop;
        self.hop_by_hop = self.hop_by_hop.wrapping_add(1);
        id
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            key: self.key,
            state: self.state,
            host_id: self.host_id.clone(),
            peer: self.peer.clone(),
        }
    }

    /// Queues an encoded frame on the connection's send path. The send
    /// fails only when the owning task is already gone.
    pub(crate) fn push_frame(&self, frame: Vec<u8>) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(key = %self.key, "Dropping frame for defunct connection");
        }
    }

    pub(crate) fn push_close(&self, close: Close) {
        let _ = self.control.send(close);
    }
}
