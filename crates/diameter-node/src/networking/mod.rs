//! Transport drivers.
//!
//! Every transport exposes the same contract to the core: an accept
//! loop, outbound connection setup, and a per-connection task that
//! frames the byte stream, feeds decoded messages to the protocol
//! engine, writes queued outbound frames, and polls the engine's
//! timers. Which transports exist is decided at compile time through
//! cargo features; the controller queries [`driver_factories`] at start
//! instead of probing the platform.

use crate::config::NodeSettings;
use crate::config::Peer;
use crate::config::TransportKind;
use crate::node::NodeInner;
use futures::future::RemoteHandle;
use std::sync::Arc;
use std::sync::Weak;

#[cfg(feature = "transport-tcp")]
pub(crate) mod tcp;

#[cfg(feature = "transport-sctp")]
pub(crate) mod sctp;

#[cfg(any(feature = "transport-tcp", feature = "transport-sctp"))]
mod stream;

#[cfg(any(feature = "transport-tcp", feature = "transport-sctp"))]
pub(crate) use stream::StreamDriver;

/// Frames above this are treated as garbage; the length field is 24
/// bits but nothing in the base protocol comes anywhere close.
pub(crate) const MAX_FRAME_LEN: usize = 1024 * 1024;

/// The contract the core depends on, identical for every transport.
pub(crate) trait TransportDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> TransportKind;

    /// Binds listeners and allocates I/O resources.
    fn open_io(&self) -> anyhow::Result<()>;

    /// Releases whatever `open_io` allocated and `start` did not consume.
    fn close_io(&self);

    /// Spawns the accept loop. Dropping the handle cancels it.
    fn start(&self) -> RemoteHandle<()>;

    /// Stop accepting new connections; established ones drain on their
    /// own deadlines.
    fn initiate_stop(&self);

    /// Unblocks the accept loop so it observes state changes.
    fn wakeup(&self);

    /// Allocates a connection record and spawns the outbound connect
    /// task. Returns `false` when the peer is immediately unroutable
    /// for this transport.
    fn initiate_connection(&self, peer: Peer) -> bool;

    /// Where the listener actually bound, once `open_io` succeeded.
    fn local_listen_addr(&self) -> Option<std::net::SocketAddr>;
}

pub(crate) struct DriverFactory {
    pub name: &'static str,
    pub kind: TransportKind,
    pub build: fn(Weak<NodeInner>, &NodeSettings) -> Arc<dyn TransportDriver>,
}

/// The transports this build carries.
pub(crate) fn driver_factories() -> Vec<DriverFactory> {
    #[allow(unused_mut)]
    let mut factories: Vec<DriverFactory> = Vec::new();
    cfg_if::cfg_if! {
        if #[cfg(feature = "transport-tcp")] {
            factories.push(DriverFactory {
                name: "tcp",
                kind: TransportKind::Tcp,
                build: |node, settings| {
                    Arc::new(StreamDriver::<tcp::TcpFamily>::new(node, settings))
                },
            });
        }
    }
    cfg_if::cfg_if! {
        if #[cfg(feature = "transport-sctp")] {
            factories.push(DriverFactory {
                name: "sctp",
                kind: TransportKind::Sctp,
                build: |node, settings| {
                    Arc::new(StreamDriver::<sctp::SctpFamily>::new(node, settings))
                },
            });
        }
    }
    factories
}
