//! The driver shared by every stream transport: socket setup differs
//! per family, everything from accept onwards is common.

use crate::config::NodeSettings;
use crate::config::Peer;
use crate::config::TransportKind;
use crate::networking::TransportDriver;
use crate::networking::MAX_FRAME_LEN;
use crate::node::connection::Close;
use crate::node::connection::ConnectionKey;
use crate::node::connection::ConnectionState;
use crate::node::engine::TimerVerdict;
use crate::node::NodeInner;
use diameter_codec::Message;
use futures::future::RemoteHandle;
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;

const READ_CHUNK: usize = 4096;

/// Socket setup for one stream transport. The SCTP family produces
/// one-to-one association sockets that behave exactly like TCP streams
/// at the file-descriptor level, which is why both can share
/// [`TcpStream`] for I/O.
pub(crate) trait StreamFamily: Send + Sync + 'static {
    const NAME: &'static str;
    const KIND: TransportKind;

    fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener>;

    fn connect(
        source_ports: Option<RangeInclusive<u16>>,
        peer: SocketAddr,
    ) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

pub(crate) struct StreamDriver<F: StreamFamily> {
    node: Weak<NodeInner>,
    listen_port: u16,
    source_ports: Option<RangeInclusive<u16>>,
    connect_timeout: Duration,
    listener: parking_lot::Mutex<Option<std::net::TcpListener>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    stopping: Arc<AtomicBool>,
    accept_notify: Arc<Notify>,
    _family: PhantomData<F>,
}

impl<F: StreamFamily> StreamDriver<F> {
    pub(crate) fn new(node: Weak<NodeInner>, settings: &NodeSettings) -> Self {
        let source_ports = match F::KIND {
            TransportKind::Tcp => settings.tcp_port_range.clone(),
            TransportKind::Sctp => None,
        };
        StreamDriver {
            node,
            listen_port: settings.listen_port,
            source_ports,
            connect_timeout: settings.watchdog_interval,
            listener: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            accept_notify: Arc::new(Notify::new()),
            _family: PhantomData,
        }
    }
}

impl<F: StreamFamily> TransportDriver for StreamDriver<F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    fn kind(&self) -> TransportKind {
        F::KIND
    }

    fn open_io(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.listen_port);
        let listener = F::bind(addr)
            .map_err(|err| anyhow::anyhow!("binding {} listener on {addr}: {err}", F::NAME))?;
        *self.local_addr.lock() = listener.local_addr().ok();
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn close_io(&self) {
        self.listener.lock().take();
    }

    fn start(&self) -> RemoteHandle<()> {
        let listener = self.listener.lock().take();
        let (fut, handle) = accept_loop::<F>(
            self.node.clone(),
            listener,
            self.stopping.clone(),
            self.accept_notify.clone(),
        )
        .remote_handle();
        tokio::spawn(fut);
        handle
    }

    fn initiate_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.accept_notify.notify_waiters();
    }

    fn wakeup(&self) {
        self.accept_notify.notify_waiters();
    }

    fn initiate_connection(&self, peer: Peer) -> bool {
        let Some(node) = self.node.upgrade() else {
            return false;
        };
        let (key, outbound_rx, control_rx) = {
            let mut reg = node.registry.lock();
            if reg.please_stop {
                return false;
            }
            // Idempotent: a connection to this peer in any state means
            // there is nothing to initiate.
            if reg.has_connection_to(&peer) {
                tracing::debug!(%peer, "Connection already exists; not initiating another");
                return true;
            }
            let (key, outbound_rx, control_rx) =
                node.new_connection(ConnectionState::Connecting, F::KIND, &mut reg);
            let conn = reg.get_mut(key).expect("connection just inserted");
            conn.peer = Some(peer.clone());
            (key, outbound_rx, control_rx)
        };
        tracing::debug!(%peer, %key, "Initiating {} connection", F::NAME);
        let source_ports = self.source_ports.clone();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(connect_task::<F>(
            node,
            key,
            peer,
            source_ports,
            connect_timeout,
            outbound_rx,
            control_rx,
        ));
        true
    }

    fn local_listen_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

async fn accept_loop<F: StreamFamily>(
    node: Weak<NodeInner>,
    listener: Option<std::net::TcpListener>,
    stopping: Arc<AtomicBool>,
    accept_notify: Arc<Notify>,
) {
    let Some(listener) = listener else {
        return;
    };
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, transport = F::NAME, "Failed to register listener with the runtime");
            return;
        }
    };
    tracing::info!(
        transport = F::NAME,
        local_addr = ?listener.local_addr().ok(),
        "Listening for peer connections"
    );
    loop {
        tokio::select! {
            _ = accept_notify.notified() => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let Some(node) = node.upgrade() else {
                        break;
                    };
                    tracing::debug!(%remote, transport = F::NAME, "Accepted inbound connection");
                    spawn_inbound(node, F::KIND, stream, remote);
                }
                Err(err) => {
                    tracing::error!(%err, transport = F::NAME, "Failed to accept incoming connection");
                }
            }
        }
        if stopping.load(Ordering::SeqCst) {
            break;
        }
    }
    tracing::debug!(transport = F::NAME, "Accept loop finished");
}

fn spawn_inbound(node: Arc<NodeInner>, kind: TransportKind, stream: TcpStream, remote: SocketAddr) {
    let (key, outbound_rx, control_rx) = {
        let mut reg = node.registry.lock();
        if reg.please_stop {
            return;
        }
        let (key, outbound_rx, control_rx) =
            node.new_connection(ConnectionState::ConnectedIn, kind, &mut reg);
        let conn = reg.get_mut(key).expect("connection just inserted");
        conn.remote_address = Some(remote);
        conn.local_addresses = stream.local_addr().map(|addr| vec![addr.ip()]).unwrap_or_default();
        (key, outbound_rx, control_rx)
    };
    tokio::spawn(run_connection(node, key, stream, outbound_rx, control_rx));
}

async fn connect_task<F: StreamFamily>(
    node: Arc<NodeInner>,
    key: ConnectionKey,
    peer: Peer,
    source_ports: Option<RangeInclusive<u16>>,
    connect_timeout: Duration,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    control_rx: mpsc::UnboundedReceiver<Close>,
) {
    let target = format!("{}:{}", peer.host, peer.port);
    let connected = tokio::time::timeout(connect_timeout, async {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in tokio::net::lookup_host(&target).await? {
            match F::connect(source_ports.clone(), addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    })
    .await;
    let stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::debug!(%peer, %key, %err, "Connection attempt failed");
            node.connection_closed(key);
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, %key, "Connection attempt timed out");
            node.connection_closed(key);
            return;
        }
    };
    let proceed = {
        let mut reg = node.registry.lock();
        if reg.please_stop {
            false
        } else if let Some(conn) = reg.get_mut(key) {
            conn.state = ConnectionState::ConnectedOut;
            conn.remote_address = stream.peer_addr().ok();
            conn.local_addresses =
                stream.local_addr().map(|addr| vec![addr.ip()]).unwrap_or_default();
            true
        } else {
            // Already removed; just drop the socket.
            return;
        }
    };
    if !proceed {
        node.connection_closed(key);
        return;
    }
    tracing::debug!(%peer, %key, "Connection setup completed");
    node.send_cer(key);
    run_connection(node, key, stream, outbound_rx, control_rx).await;
}

/// The per-connection event loop. Owns the socket; protocol state lives
/// in the registry and is only reached through the engine entry points.
async fn run_connection(
    node: Arc<NodeInner>,
    key: ConnectionKey,
    stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<Close>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut framer = FrameReader::new();
    let close = loop {
        let Some(deadline) = node.next_timeout(key) else {
            break Close::Reset;
        };
        tokio::select! {
            frame = framer.next_frame(&mut reader) => match frame {
                Ok(Some(frame)) => match Message::decode(&frame) {
                    Ok(message) => {
                        if !node.handle_message(message, key) {
                            break Close::Flush;
                        }
                    }
                    Err(err) => {
                        let garbage = hex::encode(&frame[..frame.len().min(32)]);
                        tracing::warn!(%key, %err, %garbage, "Resetting connection on undecodable frame");
                        break Close::Reset;
                    }
                },
                Ok(None) => {
                    tracing::debug!(%key, "Peer closed the connection");
                    break Close::Reset;
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(%key, %err, "Resetting connection on garbage bytes");
                    break Close::Reset;
                }
                Err(err) => {
                    tracing::debug!(%key, %err, "Read failed");
                    break Close::Reset;
                }
            },
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        tracing::debug!(%key, %err, "Write failed");
                        break Close::Reset;
                    }
                }
                None => break Close::Reset,
            },
            close = control_rx.recv() => {
                break close.unwrap_or(Close::Reset);
            }
            _ = tokio::time::sleep_until(deadline) => match node.run_timers(key) {
                TimerVerdict::Keep => {}
                TimerVerdict::CloseFlush => break Close::Flush,
                TimerVerdict::CloseReset => break Close::Reset,
            },
        }
    };
    match close {
        Close::Flush => {
            // Get queued answers (DPA, error responses) onto the wire
            // before the FIN.
            while let Ok(frame) = outbound_rx.try_recv() {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        Close::Reset => {
            // A zero linger turns the drop into an RST.
            if let Ok(stream) = reader.reunite(writer) {
                let _ = stream.set_linger(Some(Duration::ZERO));
            }
        }
    }
    node.connection_closed(key);
}

/// Incremental frame assembly. Buffers whatever has been read so the
/// enclosing `select!` can drop the in-flight future without losing
/// bytes.
struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        FrameReader {
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    async fn next_frame<R: tokio::io::AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.extract()? {
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn extract(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let prefix = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let length = Message::read_length(prefix).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{err} (prefix {})", hex::encode(prefix)),
            )
        })?;
        if length > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {length} exceeds the {MAX_FRAME_LEN} cap"),
            ));
        }
        if self.buf.len() < length {
            return Ok(None);
        }
        let rest = self.buf.split_off(length);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }
}
