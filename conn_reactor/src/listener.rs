use crate::address::AddressFamily;
use crate::id::ListenerId;
use crate::socket;
use crate::state::TlsMode;

use std::{
    io,
    net::SocketAddr,
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};

use socket2::Socket;

/// A socket waiting for inbound connections on one address family.
pub struct Listener
{
    id: ListenerId,
    socket: Socket,
    address: SocketAddr,
    tls_mode: TlsMode,
    max_lifetime: Option<Duration>,
}

impl Listener
{
    /// Bind and listen on `address`.
    pub(crate) fn open(id: ListenerId,
                       address: SocketAddr,
                       backlog: i32,
                       tls_mode: TlsMode,
                       max_lifetime: Option<Duration>,
                      ) -> io::Result<Self>
    {
        let socket = socket::listen_socket(address, backlog)?;

        // Port 0 picks a free port; report the one we actually got
        let address = socket.local_addr()?.as_socket().unwrap_or(address);

        tracing::info!(id = %id, %address, family = %AddressFamily::of(&address), ?tls_mode, "Listening");

        Ok(Self {
            id,
            socket,
            address,
            tls_mode,
            max_lifetime,
        })
    }

    pub fn id(&self) -> ListenerId
    {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr
    {
        self.address
    }

    pub fn family(&self) -> AddressFamily
    {
        AddressFamily::of(&self.address)
    }

    /// The TLS mode every connection accepted here starts with
    pub fn tls_mode(&self) -> TlsMode
    {
        self.tls_mode
    }

    pub fn max_lifetime(&self) -> Option<Duration>
    {
        self.max_lifetime
    }

    pub(crate) fn raw_fd(&self) -> RawFd
    {
        self.socket.as_raw_fd()
    }

    /// Accept one pending connection, if any. Errors other than "nothing
    /// pending" are logged and treated the same way.
    pub(crate) fn accept(&self) -> Option<(Socket, SocketAddr)>
    {
        match socket::accept(&self.socket)
        {
            Ok(accepted) => accepted,
            Err(e) =>
            {
                tracing::warn!(id = %self.id, error = %e, "accept failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn ephemeral_port_is_reported()
    {
        let listener = Listener::open(ListenerId::new(1), "127.0.0.1:0".parse().unwrap(), 5, TlsMode::None, None).unwrap();

        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.family(), AddressFamily::V4);
        assert!(listener.accept().is_none());
    }

    #[test]
    fn port_in_use()
    {
        let first = Listener::open(ListenerId::new(1), "127.0.0.1:0".parse().unwrap(), 5, TlsMode::None, None).unwrap();
        let second = Listener::open(ListenerId::new(2), first.local_addr(), 5, TlsMode::None, None);

        assert!(second.is_err());
    }
}
