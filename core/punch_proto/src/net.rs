//! Socket construction helpers
//!
//! Sockets are built with socket2 so address/port reuse can be set before
//! bind. Hole punching needs several sockets (UDP to both servers, TCP to
//! both servers) sharing one local port.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// Backlog for TCP listeners
const LISTEN_BACKLOG: i32 = 128;

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn set_reuse(socket: &Socket, reuse: bool) -> io::Result<()> {
    if !reuse {
        return Ok(());
    }
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    Ok(())
}

/// Bind a non-blocking UDP socket
pub fn bind_udp(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    set_reuse(&socket, reuse)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bind a non-blocking TCP listener
pub fn bind_tcp_listener(addr: SocketAddr, reuse: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    set_reuse(&socket, reuse)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Connect a blocking TCP stream from a fixed local address
///
/// With `reuse` set, several streams can originate from the same local port
/// as long as their remote endpoints differ. Reads and writes on the returned
/// stream time out after `timeout`.
pub fn connect_tcp_from(
    local: SocketAddr,
    remote: SocketAddr,
    timeout: Duration,
    reuse: bool,
) -> io::Result<TcpStream> {
    let socket = Socket::new(domain_for(&remote), Type::STREAM, Some(Protocol::TCP))?;
    set_reuse(&socket, reuse)?;
    socket.bind(&local.into())?;
    socket.connect_timeout(&remote.into(), timeout)?;

    let stream: TcpStream = socket.into();
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

/// Resolve `host:port` to its first IPv4 address
pub fn resolve_ipv4(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for {}", addr),
            )
        })
}
