//! SCTP stream transport, compiled under the `transport-sctp` feature.
//!
//! Uses one-to-one style SCTP sockets (`SOCK_STREAM`, `IPPROTO_SCTP`),
//! which present the same file-descriptor semantics as TCP and can
//! therefore be registered with the runtime as ordinary stream sockets.
//! Multi-homed binding is not exposed; the socket binds its primary
//! address only.

use crate::config::TransportKind;
use crate::networking::stream::StreamFamily;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use tokio::net::TcpStream;

/// Not exported by `socket2`; stable since the protocol was assigned.
const IPPROTO_SCTP: i32 = 132;

/// Pending-connect errno for a non-blocking `connect(2)`.
const EINPROGRESS: i32 = 115;

const BACKLOG: i32 = 128;

pub(crate) struct SctpFamily;

fn new_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::from(IPPROTO_SCTP)),
    )?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl StreamFamily for SctpFamily {
    const NAME: &'static str = "sctp";
    const KIND: TransportKind = TransportKind::Sctp;

    fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
        let socket = new_socket(addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        Ok(socket.into())
    }

    async fn connect(
        _source_ports: Option<RangeInclusive<u16>>,
        peer: SocketAddr,
    ) -> io::Result<TcpStream> {
        let socket = new_socket(peer)?;
        match socket.connect(&peer.into()) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.raw_os_error() == Some(EINPROGRESS) => {}
            Err(err) => return Err(err),
        }
        let stream = TcpStream::from_std(socket.into())?;
        stream.writable().await?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        // Connect completion is signalled by writability; a socket that
        // is writable with no pending error has an established
        // association.
        stream.peer_addr()?;
        Ok(stream)
    }
}
