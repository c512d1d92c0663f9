//! The node controller: lifecycle, the reconnect worker, and the public
//! send/lookup surface. The protocol state machine itself lives in
//! [`engine`].

use crate::config::NodeSettings;
use crate::config::Peer;
use crate::config::TransportKind;
use crate::networking::driver_factories;
use crate::networking::TransportDriver;
use crate::node::connection::Close;
use crate::node::connection::Connection;
use crate::node::connection::ConnectionInfo;
use crate::node::connection::ConnectionKey;
use crate::node::connection::ConnectionState;
use crate::node::events::ConnectionListener;
use crate::node::events::MessageDispatcher;
use crate::node::events::NodeValidator;
use crate::node::registry::Registry;
use crate::node::state::NodeState;
use crate::node::timers::ConnectionTimers;
use anyhow::bail;
use anyhow::Result;
use diameter_codec::Message;
use diameter_codec::DISCONNECT_CAUSE_REBOOTING;
use futures::future::RemoteHandle;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

pub(crate) mod connection;
pub(crate) mod engine;
pub(crate) mod registry;
pub(crate) mod state;
pub(crate) mod timers;

pub mod events;

/// How often the reconnect worker re-checks its persistent peers when
/// nothing wakes it earlier.
const RECONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Connection churn fires the reconnect wakeup freely; the worker never
/// scans more than about once a second so a refused peer cannot turn
/// the close/retry cycle into a busy loop.
const RECONNECT_DAMPING: Duration = Duration::from_secs(1);

/// How long `stop` waits for connection tasks to unwind after the grace
/// deadline already expired.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced to callers of the node API.
///
/// `start` and `Node::new` report through `anyhow`; the
/// [`NodeError::AlreadyRunning`] and [`NodeError::InvalidSettings`]
/// cases stay downcastable so callers can tell them apart from
/// transport-initialization failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The connection key is unknown, the connection is not ready, or
    /// the node is shutting down.
    #[error("stale connection")]
    StaleConnection,
    #[error("node is not running")]
    NotRunning,
    #[error("node is already running")]
    AlreadyRunning,
    #[error("timed out waiting for a peer connection")]
    WaitTimeout,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// An RFC 3588 Diameter peer node.
///
/// Owns the peer registry and the protocol engine; transport drivers
/// and the reconnect worker run as background tasks for as long as the
/// [`RunningNode`] returned by [`Node::start`] is alive.
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

/// The node is running until this is dropped or [`Node::stop`] is
/// called.
pub struct RunningNode {
    _handles: Vec<RemoteHandle<()>>,
}

impl std::fmt::Debug for RunningNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningNode").finish_non_exhaustive()
    }
}

pub(crate) struct NodeInner {
    pub(crate) settings: NodeSettings,
    pub(crate) state: NodeState,
    /// The one registry mutex of the concurrency model; see
    /// [`Registry`].
    pub(crate) registry: Mutex<Registry>,
    /// Wakes the reconnect worker and `stop`'s drain loop.
    pub(crate) registry_notify: Notify,
    /// Broadcast when a connection reaches ready or the node stops.
    /// Never awaited while the registry mutex is held.
    pub(crate) conn_available: Notify,
    pub(crate) dispatcher: Arc<dyn MessageDispatcher>,
    pub(crate) listener: Arc<dyn ConnectionListener>,
    pub(crate) validator: Arc<dyn NodeValidator>,
    pub(crate) drivers: Mutex<Vec<Arc<dyn TransportDriver>>>,
    pub(crate) running: AtomicBool,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        dispatcher: Arc<dyn MessageDispatcher>,
        listener: Arc<dyn ConnectionListener>,
        validator: Arc<dyn NodeValidator>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|err| NodeError::InvalidSettings(format!("{err:#}")))?;
        Ok(Self::assemble(settings, dispatcher, listener, validator))
    }

    /// Test entry that skips settings validation, so scenarios can run
    /// with very short watchdog intervals.
    #[cfg(test)]
    pub(crate) fn new_unvalidated(
        settings: NodeSettings,
        dispatcher: Arc<dyn MessageDispatcher>,
        listener: Arc<dyn ConnectionListener>,
        validator: Arc<dyn NodeValidator>,
    ) -> Self {
        Self::assemble(settings, dispatcher, listener, validator)
    }

    fn assemble(
        settings: NodeSettings,
        dispatcher: Arc<dyn MessageDispatcher>,
        listener: Arc<dyn ConnectionListener>,
        validator: Arc<dyn NodeValidator>,
    ) -> Self {
        Node {
            inner: Arc::new(NodeInner {
                settings,
                state: NodeState::new(),
                registry: Mutex::new(Registry::new()),
                registry_notify: Notify::new(),
                conn_available: Notify::new(),
                dispatcher,
                listener,
                validator,
                drivers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.inner.settings
    }

    /// Loads the transport drivers this build carries, honoring the
    /// required/optional/disabled policy per transport, and spawns the
    /// event loops. Must run inside a tokio runtime.
    ///
    /// Fails with [`NodeError::AlreadyRunning`] (downcastable from the
    /// returned error) when called on a node that is already started.
    pub fn start(&self) -> Result<RunningNode> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyRunning.into());
        }
        {
            let mut reg = inner.registry.lock();
            reg.please_stop = false;
            reg.shutdown_deadline = None;
        }
        let factories = driver_factories();
        let mut drivers: Vec<Arc<dyn TransportDriver>> = Vec::new();
        for factory in &factories {
            let policy = inner.settings.policy_for(factory.kind);
            if policy == crate::config::TransportPolicy::Disabled {
                tracing::debug!(transport = factory.name, "Transport disabled by configuration");
                continue;
            }
            let driver = (factory.build)(Arc::downgrade(inner), &inner.settings);
            match driver.open_io() {
                Ok(()) => drivers.push(driver),
                Err(err) if policy == crate::config::TransportPolicy::Required => {
                    inner.running.store(false, Ordering::SeqCst);
                    return Err(err.context(format!(
                        "required transport {} failed to initialize",
                        factory.name
                    )));
                }
                Err(err) => {
                    tracing::warn!(
                        transport = factory.name,
                        "Optional transport failed to initialize, skipping: {err:#}"
                    );
                }
            }
        }
        for kind in [TransportKind::Tcp, TransportKind::Sctp] {
            if inner.settings.policy_for(kind) == crate::config::TransportPolicy::Required
                && !drivers.iter().any(|driver| driver.kind() == kind)
            {
                inner.running.store(false, Ordering::SeqCst);
                bail!("required transport {kind} is not built into this binary");
            }
        }
        if drivers.is_empty() {
            tracing::warn!("No transport drivers loaded; node starts without connectivity");
        }
        let mut handles = Vec::with_capacity(drivers.len() + 1);
        for driver in &drivers {
            handles.push(driver.start());
        }
        *inner.drivers.lock() = drivers;
        let (fut, handle) = reconnect_worker(inner.clone()).remote_handle();
        tokio::spawn(fut);
        handles.push(handle);
        tracing::info!(host_id = %inner.settings.host_id, "Node started");
        Ok(RunningNode { _handles: handles })
    }

    /// Graceful shutdown with a wall-clock deadline.
    ///
    /// Ready connections get a DPR with cause REBOOTING and may drain
    /// until the deadline; the DPA is not waited for beyond it.
    /// Handshake-phase connections are reset immediately.
    pub async fn stop(&self, grace: Duration) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + grace;
        tracing::info!(?grace, "Stopping node");
        {
            let mut reg = inner.registry.lock();
            reg.please_stop = true;
            reg.shutdown_deadline = Some(deadline);
            for key in reg.keys() {
                match reg.get(key).map(|conn| conn.state) {
                    Some(
                        ConnectionState::Connecting
                        | ConnectionState::ConnectedIn
                        | ConnectionState::ConnectedOut,
                    ) => {
                        if let Some(conn) = reg.get(key) {
                            conn.push_close(Close::Reset);
                        }
                    }
                    Some(ConnectionState::Ready) => {
                        inner.initiate_connection_close(&mut reg, key, DISCONNECT_CAUSE_REBOOTING)
                    }
                    _ => {}
                }
            }
        }
        for driver in inner.drivers.lock().iter() {
            tracing::debug!(transport = driver.name(), "Stopping transport driver");
            driver.initiate_stop();
            driver.wakeup();
        }
        inner.registry_notify.notify_waiters();
        inner.conn_available.notify_waiters();
        inner.drain_connections(deadline).await;
        {
            let reg = inner.registry.lock();
            for conn in reg.connections.values() {
                conn.push_close(Close::Reset);
            }
        }
        inner.drain_connections(Instant::now() + STOP_SETTLE_TIMEOUT).await;
        for driver in inner.drivers.lock().drain(..) {
            driver.close_io();
        }
        inner.conn_available.notify_waiters();
        inner.running.store(false, Ordering::SeqCst);
        tracing::info!("Node stopped");
    }

    /// Initiates a connection to `peer` unless one already exists.
    /// With `persistent`, the peer is also added to the reconnect
    /// worker's set; that membership is never removed.
    pub fn connect_to_peer(&self, peer: Peer, persistent: bool) -> Result<bool, NodeError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(NodeError::NotRunning);
        }
        {
            let mut reg = inner.registry.lock();
            if reg.please_stop {
                return Err(NodeError::NotRunning);
            }
            if persistent {
                reg.persistent_peers.insert(peer.clone());
            }
        }
        Ok(inner.initiate_connection(&peer))
    }

    /// Queues `message` on the ready connection identified by `key`.
    ///
    /// Requests get a fresh hop-by-hop identifier sampled under the
    /// registry lock, which also serializes the outbound order; an
    /// end-to-end identifier is filled in when the caller left it zero.
    pub fn send_message(&self, key: ConnectionKey, mut message: Message) -> Result<(), NodeError> {
        let inner = &self.inner;
        let mut reg = inner.registry.lock();
        if reg.please_stop || !inner.running.load(Ordering::SeqCst) {
            return Err(NodeError::StaleConnection);
        }
        let Some(conn) = reg.get_mut(key) else {
            return Err(NodeError::StaleConnection);
        };
        if conn.state != ConnectionState::Ready {
            return Err(NodeError::StaleConnection);
        }
        if message.is_request() {
            message.header.hop_by_hop_id = conn.next_hop_by_hop();
            if message.header.end_to_end_id == 0 {
                message.header.end_to_end_id = inner.state.next_end_to_end();
            }
        }
        conn.push_frame(message.encode());
        Ok(())
    }

    /// Blocks until at least one connection is ready. Returns
    /// [`NodeError::NotRunning`] once the node is stopping.
    pub async fn wait_for_connection(&self) -> Result<(), NodeError> {
        loop {
            let notified = self.inner.conn_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let reg = self.inner.registry.lock();
                if reg.ready_count() > 0 {
                    return Ok(());
                }
                if reg.please_stop || !self.inner.running.load(Ordering::SeqCst) {
                    return Err(NodeError::NotRunning);
                }
            }
            notified.await;
        }
    }

    /// Like [`Node::wait_for_connection`] but fails with
    /// [`NodeError::WaitTimeout`] when the limit expires first.
    pub async fn wait_for_connection_timeout(&self, limit: Duration) -> Result<(), NodeError> {
        match tokio::time::timeout(limit, self.wait_for_connection()).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::WaitTimeout),
        }
    }

    pub fn connection_info(&self, key: ConnectionKey) -> Result<ConnectionInfo, NodeError> {
        let reg = self.inner.registry.lock();
        reg.get(key)
            .map(Connection::info)
            .ok_or(NodeError::StaleConnection)
    }

    pub fn is_valid_connection(&self, key: ConnectionKey) -> bool {
        self.inner.registry.lock().is_valid(key)
    }

    /// The ready connection to `peer`, if any.
    pub fn find_connection(&self, peer: &Peer) -> Option<ConnectionKey> {
        self.inner.registry.lock().find_ready_by_peer(peer)
    }

    pub fn list_ready_peers(&self) -> Vec<Peer> {
        let reg = self.inner.registry.lock();
        reg.connections
            .values()
            .filter(|conn| conn.state == ConnectionState::Ready)
            .filter_map(|conn| conn.peer.clone())
            .collect()
    }

    /// `<host-id>;<high>;<low>[;<optional>]`, unique for the life of
    /// the process.
    pub fn make_new_session_id(&self, optional: Option<&str>) -> String {
        self.inner
            .state
            .make_session_id(&self.inner.settings.host_id, optional)
    }

    pub fn next_end_to_end(&self) -> u32 {
        self.inner.state.next_end_to_end()
    }

    /// Where the given transport is listening, once the node started.
    pub fn listen_addr(&self, transport: TransportKind) -> Option<std::net::SocketAddr> {
        self.inner
            .drivers
            .lock()
            .iter()
            .find(|driver| driver.kind() == transport)
            .and_then(|driver| driver.local_listen_addr())
    }

    /// Our Origin-State-Id.
    pub fn state_id(&self) -> u32 {
        self.inner.state.state_id()
    }
}

impl NodeInner {
    /// Allocates the channels and registry record for one connection.
    pub(crate) fn new_connection(
        &self,
        state: ConnectionState,
        transport: TransportKind,
        reg: &mut Registry,
    ) -> (
        ConnectionKey,
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedReceiver<Close>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let timers = ConnectionTimers::new(
            self.settings.watchdog_interval,
            self.settings.idle_timeout,
            self.settings.jitter_prng,
            Instant::now(),
        );
        let conn = Connection::new(state, transport, timers, outbound_tx, control_tx);
        let key = reg.insert(conn);
        (key, outbound_rx, control_rx)
    }

    /// Hands the peer to the driver owning its transport.
    pub(crate) fn initiate_connection(&self, peer: &Peer) -> bool {
        let driver = self
            .drivers
            .lock()
            .iter()
            .find(|driver| driver.kind() == peer.transport)
            .cloned();
        match driver {
            Some(driver) => driver.initiate_connection(peer.clone()),
            None => {
                tracing::warn!(%peer, "No transport driver loaded for peer");
                false
            }
        }
    }

    /// Waits until the registry has no connections left, or `deadline`.
    async fn drain_connections(&self, deadline: Instant) {
        loop {
            let notified = self.registry_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.registry.lock().connections.is_empty() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }
}

/// Re-initiates outbound connections for every persistent peer not
/// currently connected. Runs until the node stops; wakes on
/// `registry_notify` or every [`RECONNECT_CHECK_INTERVAL`].
async fn reconnect_worker(inner: Arc<NodeInner>) {
    loop {
        {
            let notified = inner.registry_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(RECONNECT_CHECK_INTERVAL, notified).await;
        }
        if inner.registry.lock().please_stop {
            break;
        }
        tokio::time::sleep(RECONNECT_DAMPING).await;
        let peers: Vec<Peer> = {
            let reg = inner.registry.lock();
            if reg.please_stop {
                break;
            }
            reg.persistent_peers
                .iter()
                .filter(|peer| !reg.has_connection_to(peer))
                .cloned()
                .collect()
        };
        for peer in peers {
            tracing::debug!(%peer, "Reconnecting persistent peer");
            inner.initiate_connection(&peer);
        }
    }
    tracing::debug!("Reconnect worker finished");
}
