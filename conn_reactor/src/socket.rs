//! Creation of non-blocking sockets for listeners and outbound connections.

use crate::address::AddressFamily;

use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use nix::sys::signal::{signal, SigHandler, Signal};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};

/// The kind of socket an outbound connection uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SockType {
    Stream,
    Datagram,
}

/// What happened when a non-blocking `connect()` was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

fn domain(family: AddressFamily) -> Domain {
    match family {
        AddressFamily::V4 => Domain::IPV4,
        AddressFamily::V6 => Domain::IPV6,
    }
}

/// `EAGAIN` and `EINTR` are not errors for a non-blocking socket; the operation
/// is simply retried on a later cycle.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Create a listening socket bound to `addr`.
///
/// IPv6 listeners are restricted to IPv6 traffic so that an IPv4 listener can
/// share the same port number.
pub fn listen_socket(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let family = AddressFamily::of(&addr);
    let socket = Socket::new(domain(family), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if family == AddressFamily::V6 {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}

/// Create a socket for an outbound connection, optionally bound to a local
/// address first. Failure to bind the local address is logged and ignored.
pub fn outbound_socket(
    family: AddressFamily,
    socktype: SockType,
    local: Option<IpAddr>,
) -> io::Result<Socket> {
    let socket = match socktype {
        SockType::Stream => Socket::new(domain(family), Type::STREAM, Some(Protocol::TCP))?,
        SockType::Datagram => Socket::new(domain(family), Type::DGRAM, Some(Protocol::UDP))?,
    };

    if let Some(local) = local {
        let local_addr = SocketAddr::new(local, 0);
        if let Err(e) = socket.bind(&local_addr.into()) {
            tracing::warn!(%local, error = %e, "Cannot bind connection to local address");
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Start a non-blocking connect.
pub fn start_connect(socket: &Socket, peer: SocketAddr) -> io::Result<ConnectStatus> {
    match socket.connect(&peer.into()) {
        Ok(()) => Ok(ConnectStatus::Connected),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(ConnectStatus::InProgress),
        Err(e) if is_transient(&e) => Ok(ConnectStatus::InProgress),
        Err(e) => Err(e),
    }
}

/// Accept one pending connection, if there is one.
///
/// The new socket is switched to non-blocking mode before it is returned.
pub fn accept(listener: &Socket) -> io::Result<Option<(Socket, SocketAddr)>> {
    let (socket, addr) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if is_transient(&e) => return Ok(None),
        Err(e) => return Err(e),
    };

    socket.set_nonblocking(true)?;

    let addr = addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "accepted a non-IP connection")
    })?;

    Ok(Some((socket, addr)))
}

/// Socket I/O must not kill the process when a peer goes away mid-write.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN does not run any handler code.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        tracing::warn!(error = %e, "Cannot ignore SIGPIPE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_and_accept_nothing() {
        let socket = listen_socket("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        assert!(matches!(accept(&socket), Ok(None)));
    }

    #[test]
    fn connect_to_listener() {
        let listener = listen_socket("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let client = outbound_socket(AddressFamily::V4, SockType::Stream, None).unwrap();
        let status = start_connect(&client, addr).unwrap();
        assert!(matches!(status, ConnectStatus::Connected | ConnectStatus::InProgress));

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(a) = accept(&listener).unwrap() {
                accepted = Some(a);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (_, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer.ip(), addr.ip());
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
