use crate::config::TransportKind;
use crate::networking::stream::StreamFamily;
use std::io;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;

pub(crate) struct TcpFamily;

impl StreamFamily for TcpFamily {
    const NAME: &'static str = "tcp";
    const KIND: TransportKind = TransportKind::Tcp;

    fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    async fn connect(
        source_ports: Option<RangeInclusive<u16>>,
        peer: SocketAddr,
    ) -> io::Result<TcpStream> {
        let socket = match source_ports {
            Some(range) => bind_in_range(peer, range)?,
            None => new_socket(peer)?,
        };
        let stream = socket.connect(peer).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn new_socket(peer: SocketAddr) -> io::Result<TcpSocket> {
    if peer.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

/// Walks the configured source-port range and returns a socket bound to
/// the first free port.
fn bind_in_range(peer: SocketAddr, range: RangeInclusive<u16>) -> io::Result<TcpSocket> {
    let local: IpAddr = if peer.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    for port in range {
        let socket = new_socket(peer)?;
        match socket.bind(SocketAddr::new(local, port)) {
            Ok(()) => return Ok(socket),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "tcp source-port range exhausted",
    ))
}
